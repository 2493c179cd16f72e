/// Machine state codes reported by line PLCs. Every non-zero code is a single bit.
const STATE_LABELS: [(i32, &str); 17] = [
    (0, "Idle"),
    (1, "Running"),
    (2, "Stopped"),
    (4, "Starved"),
    (8, "Blocked"),
    (16, "Faulted"),
    (32, "Manual Stop"),
    (64, "Emergency Stop"),
    (128, "Changeover"),
    (256, "Cleaning"),
    (512, "Maintenance"),
    (1024, "Setup"),
    (2048, "Warm Up"),
    (4096, "Door Open"),
    (8192, "Waiting For Material"),
    (16384, "Quality Hold"),
    (32768, "Power Off"),
];

pub fn known_state_label(code: i32) -> Option<&'static str> {
    STATE_LABELS
        .iter()
        .find(|(candidate, _)| *candidate == code)
        .map(|(_, label)| *label)
}

pub fn state_label(code: i32) -> String {
    match known_state_label(code) {
        Some(label) => label.to_string(),
        None => format!("Unknown State ({code})"),
    }
}
