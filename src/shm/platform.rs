// POSIX shared memory naming
//
// Segment names are flat ("/name", no further slashes) and macOS caps them at 31
// bytes, so every group gets a short random prefix and each segment a short suffix.

use uuid::Uuid;

/// Longest segment name accepted on every supported platform (macOS PSHMNAMLEN).
pub const MAX_SEGMENT_NAME_LEN: usize = 31;

/// A fresh prefix such as `/sc-1a2b3c4d`, unique per camera group.
pub fn group_prefix() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("/sc-{}", &token[..8])
}

/// Join a prefix and a suffix into a segment name, e.g. `/sc-1a2b3c4d-cam0-flags`.
pub fn segment_name(prefix: &str, suffix: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + suffix.len() + 2);
    if !prefix.starts_with('/') {
        name.push('/');
    }
    name.push_str(prefix);
    name.push('-');
    name.push_str(&suffix.replace(['/', ':', ' '], "_"));
    name
}

/// Round a segment size up to whole pages.
pub fn page_aligned(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names_fit_platform_limit() {
        let prefix = group_prefix();
        let name = segment_name(&prefix, "cam12-mbox-up-lr");
        assert!(name.starts_with("/sc-"));
        assert!(name.len() <= MAX_SEGMENT_NAME_LEN, "{name} is too long");
        assert_eq!(name.matches('/').count(), 1);
    }

    #[test]
    fn test_page_alignment() {
        let page = page_size::get();
        assert_eq!(page_aligned(1), page);
        assert_eq!(page_aligned(page), page);
        assert_eq!(page_aligned(page + 1), 2 * page);
    }
}
