use rand::Rng;

/// Identifies this invocation's slice of the shared state directory: the
/// controller's pid plus the invoking (possibly sudo-original) uid, so two
/// concurrent runs by the same user never collide.
pub fn unique_run_name(pid: u32, uid: u32) -> String {
    format!("{pid}-{uid}")
}

/// An experiment tag, used when none was supplied on the command line.
pub fn generate_experiment_tag() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_run_name_format() {
        assert_eq!(unique_run_name(4242, 0), "4242-0");
    }

    #[test]
    fn test_generate_experiment_tag_length() {
        let tag = generate_experiment_tag();
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
