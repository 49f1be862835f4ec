use rand::distributions::Alphanumeric;
use rand::Rng;

/// Longest valid DNS-1123 label.
pub const MAX_NAME_LENGTH: usize = 63;

const RANDOM_SUFFIX_LENGTH: usize = 8;

/// `prefix` followed by `-` and a random lowercase alphanumeric suffix, so
/// that repeated test runs never collide on resource names.
pub fn append_random_string(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LENGTH)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{prefix}-{suffix}")
}

/// Resource name derived from a test name: kebab-case, at most 63
/// characters, starting with a letter and ending with an alphanumeric.
///
/// `TestBlueGreenRoute` becomes `blue-green-route`; `test_probe::ingress`
/// becomes `probe-ingress`.
pub fn object_name_for_test(test_name: &str) -> String {
    let trimmed = test_name
        .rsplit("::")
        .next()
        .unwrap_or(test_name)
        .trim_start_matches("Test")
        .trim_start_matches("test_");

    let mut name = String::with_capacity(trimmed.len());
    let mut previous_lower = false;
    for c in trimmed.chars() {
        if c.is_ascii_uppercase() {
            if previous_lower {
                name.push('-');
            }
            name.push(c.to_ascii_lowercase());
            previous_lower = false;
        } else if c.is_ascii_alphanumeric() {
            name.push(c);
            previous_lower = true;
        } else if !name.ends_with('-') && !name.is_empty() {
            name.push('-');
            previous_lower = false;
        }
    }

    let mut name: String = name.chars().take(MAX_NAME_LENGTH).collect();
    while name.ends_with('-') {
        name.pop();
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name = format!("t-{name}");
        name.truncate(MAX_NAME_LENGTH);
        while name.ends_with('-') {
            name.pop();
        }
    }
    name
}
