pub mod cli;
pub mod config;
pub mod db;
pub mod services;
pub mod state;
pub mod time;

#[cfg(test)]
pub mod test_support;
