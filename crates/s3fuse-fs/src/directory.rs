use tracing::debug;

use s3fuse_base::error::{Error, Result};
use s3fuse_base::request::{HttpMethod, Request};
use s3fuse_base::{url, xml};

use crate::context::FsContext;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name relative to the directory being listed.
    pub name: String,
    /// True for subdirectories.
    pub is_directory: bool,
}

impl DirEntry {
    fn file(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_directory: false,
        }
    }

    fn directory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_directory: true,
        }
    }
}

/// Folds one page of a `ListBucketResult` into `entries`.
///
/// Returns the marker for the next page, or `None` on the last page.
fn parse_listing_page(body: &str, prefix: &str, entries: &mut Vec<DirEntry>) -> Option<String> {
    let mut last_key = String::new();

    for key in xml::find_all(body, "Key") {
        last_key = key.clone();
        if let Some(name) = key.strip_prefix(prefix) {
            // the directory's own marker object lists as an empty name
            if !name.is_empty() && !name.contains('/') {
                entries.push(DirEntry::file(name));
            }
        }
    }

    for common in xml::find_all(body, "Prefix") {
        // the first <Prefix> is the query echoed back
        if common == prefix {
            continue;
        }
        if let Some(rest) = common.strip_prefix(prefix) {
            let name = rest.trim_end_matches('/');
            if !name.is_empty() {
                entries.push(DirEntry::directory(name));
            }
        }
    }

    if xml::find_first(body, "IsTruncated").as_deref() == Some("true") {
        let marker = xml::find_first(body, "NextMarker").unwrap_or(last_key);
        if marker.is_empty() {
            return None;
        }
        return Some(marker);
    }
    None
}

/// Lists the direct children of `path` (empty string for the bucket root),
/// following truncated listings until the store reports the last page.
pub fn read_directory(req: &mut Request, ctx: &FsContext, path: &str) -> Result<Vec<DirEntry>> {
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };

    let mut entries = Vec::new();
    let mut marker = String::new();

    loop {
        req.init(HttpMethod::Get)?;
        req.set_url(
            ctx.service.bucket_url(),
            &format!(
                "delimiter=/&prefix={}&marker={}",
                url::encode(&prefix),
                url::encode(&marker)
            ),
        );
        req.run(None)?;

        if req.response_code() != 200 {
            return Err(Error::RequestFailed {
                status: req.response_code(),
            });
        }

        match parse_listing_page(&req.response_string(), &prefix, &mut entries) {
            Some(next) => marker = next,
            None => break,
        }
    }

    debug!(path, count = entries.len(), "listed directory");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root_listing() {
        // files and one common prefix at the bucket root
        let body = r#"<?xml version="1.0"?>
<ListBucketResult>
  <Prefix></Prefix>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>a</Key></Contents>
  <CommonPrefixes><Prefix>b/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

        let mut entries = Vec::new();
        let next = parse_listing_page(body, "", &mut entries);
        assert!(next.is_none());
        assert_eq!(
            entries,
            vec![DirEntry::file("a"), DirEntry::directory("b")]
        );
    }

    #[test]
    fn test_parse_subdirectory_listing_strips_prefix() {
        let body = r#"<?xml version="1.0"?>
<ListBucketResult>
  <Prefix>photos/</Prefix>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>photos/</Key></Contents>
  <Contents><Key>photos/cat.jpg</Key></Contents>
  <CommonPrefixes><Prefix>photos/2024/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

        let mut entries = Vec::new();
        parse_listing_page(body, "photos/", &mut entries);
        // the photos/ marker object itself is not an entry
        assert_eq!(
            entries,
            vec![DirEntry::file("cat.jpg"), DirEntry::directory("2024")]
        );
    }

    #[test]
    fn test_truncated_listing_yields_marker() {
        let body = r#"<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextMarker>m1</NextMarker>
  <Contents><Key>a</Key></Contents>
</ListBucketResult>"#;

        let mut entries = Vec::new();
        assert_eq!(
            parse_listing_page(body, "", &mut entries),
            Some("m1".to_string())
        );
    }

    #[test]
    fn test_truncated_listing_falls_back_to_last_key() {
        let body = r#"<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>a</Key></Contents>
  <Contents><Key>b</Key></Contents>
</ListBucketResult>"#;

        let mut entries = Vec::new();
        assert_eq!(
            parse_listing_page(body, "", &mut entries),
            Some("b".to_string())
        );
    }
}
