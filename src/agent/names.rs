use std::collections::HashSet;

/// Fixed pool tried in order before falling back to numbered names.
const NAME_POOL: [&str; 16] = [
    "Sam", "Alex", "Riley", "Jordan", "Casey", "Morgan", "Quinn", "Avery", "Rowan", "Harper",
    "Sage", "Emerson", "Finley", "Dakota", "Reese", "Skyler",
];

/// First unused name from the pool; once exhausted, `Agent N` with the
/// smallest unused N.
pub fn next_name(taken: &HashSet<String>) -> String {
    for name in NAME_POOL {
        if !taken.contains(name) {
            return name.to_string();
        }
    }
    let mut n = 1;
    loop {
        let candidate = format!("Agent {}", n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
