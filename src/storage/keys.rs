//! Mapping between repository-relative paths and remote object keys.
use once_cell::sync::Lazy;
use regex::Regex;

/// `<stem>-<width>x<height>[-<variant>].<ext>`
static THUMBNAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<stem>.+)-\d+x\d+(?:-[A-Za-z0-9_]+)?\.(?P<ext>[A-Za-z0-9]+)$")
        .expect("valid thumbnail pattern")
});

/// Whether a path or key names a derived thumbnail rather than an original.
pub fn is_thumbnail(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    THUMBNAIL_RE.is_match(name)
}

/// Path of the original a thumbnail was derived from (`a/b-150x150.jpg` ->
/// `a/b.jpg`).
pub fn original_for_thumbnail(path: &str) -> Option<String> {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let caps = THUMBNAIL_RE.captures(name)?;
    let original = format!("{}.{}", &caps["stem"], &caps["ext"]);
    Some(match dir {
        Some(dir) => format!("{}/{}", dir, original),
        None => original,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    base_prefix: String,
    public_url: String,
}

impl KeyMapper {
    pub fn new(base_prefix: &str, public_url: &str) -> Self {
        Self {
            base_prefix: base_prefix.trim_matches('/').to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Listing prefix, with a trailing `/` when non-empty.
    pub fn list_prefix(&self) -> String {
        if self.base_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.base_prefix)
        }
    }

    pub fn object_key(&self, relative_path: &str) -> String {
        let rel = relative_path.trim_start_matches('/');
        if self.base_prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", self.base_prefix, rel)
        }
    }

    /// Repository-relative path for a key, or `None` when the key lives
    /// outside the base prefix.
    pub fn relative_path(&self, key: &str) -> Option<String> {
        let key = key.trim_start_matches('/');
        if self.base_prefix.is_empty() {
            return Some(key.to_string()).filter(|k| !k.is_empty());
        }
        key.strip_prefix(&self.base_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }

    /// Public URL of a key; the bare key when no public URL is configured.
    pub fn public_url(&self, key: &str) -> String {
        if self.public_url.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.public_url, key.trim_start_matches('/'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_thumbnails() {
        assert!(is_thumbnail("2024/01/photo-150x150.jpg"));
        assert!(is_thumbnail("photo-1024x768-scaled.webp"));
        assert!(!is_thumbnail("2024/01/photo.jpg"));
        assert!(!is_thumbnail("2024/01/photo-final.jpg"));
        // only the file name is inspected
        assert!(!is_thumbnail("2024/dir-10x10/photo.jpg"));
    }

    #[test]
    fn maps_thumbnail_back_to_original() {
        assert_eq!(
            original_for_thumbnail("2024/01/photo-150x150.jpg").as_deref(),
            Some("2024/01/photo.jpg")
        );
        assert_eq!(
            original_for_thumbnail("a-300x200-crop.png").as_deref(),
            Some("a.png")
        );
        assert_eq!(original_for_thumbnail("plain.png"), None);
    }

    #[test]
    fn keys_round_trip_through_prefix() {
        let mapper = KeyMapper::new("/site/uploads/", "https://cdn.example.com/");
        assert_eq!(mapper.list_prefix(), "site/uploads/");
        let key = mapper.object_key("2024/01/a.jpg");
        assert_eq!(key, "site/uploads/2024/01/a.jpg");
        assert_eq!(mapper.relative_path(&key).as_deref(), Some("2024/01/a.jpg"));
        assert_eq!(mapper.relative_path("other/2024/a.jpg"), None);
        assert_eq!(mapper.relative_path("site/uploadsX/a.jpg"), None);
        assert_eq!(
            mapper.public_url(&key),
            "https://cdn.example.com/site/uploads/2024/01/a.jpg"
        );
    }

    #[test]
    fn empty_prefix_is_identity() {
        let mapper = KeyMapper::new("", "");
        assert_eq!(mapper.list_prefix(), "");
        assert_eq!(mapper.object_key("u/5.jpg"), "u/5.jpg");
        assert_eq!(mapper.relative_path("u/5.jpg").as_deref(), Some("u/5.jpg"));
        assert_eq!(mapper.public_url("u/5.jpg"), "u/5.jpg");
    }
}
