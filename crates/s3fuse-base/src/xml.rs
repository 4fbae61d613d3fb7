//! Just enough XML for the S3 API surface.
//!
//! The responses the daemon consumes (`ListBucketResult`, `CopyObjectResult`,
//! `InitiateMultipartUploadResult`) are flat and produced by the store, so a
//! scanning extractor is sufficient; no document model is built.

/// Returns the text of the first `<tag>...</tag>` element, unescaped.
pub fn find_first(doc: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let start = doc.find(&open)? + open.len();
    let end = doc[start..].find(&close)? + start;

    Some(unescape(&doc[start..end]))
}

/// Returns the text of every `<tag>...</tag>` element, in document order.
pub fn find_all(doc: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = doc;

    while let Some(pos) = rest.find(&open) {
        let start = pos + open.len();
        let Some(len) = rest[start..].find(&close) else {
            break;
        };
        out.push(unescape(&rest[start..start + len]));
        rest = &rest[start + len + close.len()..];
    }

    out
}

/// Incremental builder for the request documents the daemon sends.
pub struct XmlBuilder {
    buf: String,
}

impl XmlBuilder {
    /// Starts a document with the standard declaration.
    pub fn new() -> Self {
        Self {
            buf: "<?xml version=\"1.0\" encoding=\"UTF-8\"?>".to_string(),
        }
    }

    /// Opens an element.
    pub fn open(&mut self, tag: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
        self
    }

    /// Closes an element.
    pub fn close(&mut self, tag: &str) -> &mut Self {
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push('>');
        self
    }

    /// Writes a leaf element with escaped text content.
    pub fn elem(&mut self, tag: &str, value: &str) -> &mut Self {
        self.open(tag);
        self.buf.push_str(&escape(value));
        self.close(tag)
    }

    /// Finishes the document.
    pub fn finish(self) -> String {
        self.buf
    }
}

impl Default for XmlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextMarker>m1</NextMarker>
  <Contents><Key>a</Key></Contents>
  <Contents><Key>b &amp; c</Key></Contents>
  <CommonPrefixes><Prefix>d/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn test_find_first() {
        assert_eq!(find_first(LISTING, "IsTruncated").as_deref(), Some("true"));
        assert_eq!(find_first(LISTING, "NextMarker").as_deref(), Some("m1"));
        assert_eq!(find_first(LISTING, "Missing"), None);
    }

    #[test]
    fn test_find_all_unescapes() {
        assert_eq!(find_all(LISTING, "Key"), vec!["a", "b & c"]);
        assert_eq!(find_all(LISTING, "Prefix"), vec!["d/"]);
        assert!(find_all(LISTING, "Missing").is_empty());
    }

    #[test]
    fn test_builder_escapes() {
        let mut xb = XmlBuilder::new();
        xb.open("CompleteMultipartUpload");
        xb.open("Part");
        xb.elem("PartNumber", "1");
        xb.elem("ETag", "\"abc\"");
        xb.close("Part");
        xb.close("CompleteMultipartUpload");

        let doc = xb.finish();
        assert!(doc.starts_with("<?xml"));
        assert!(doc.contains("<ETag>&quot;abc&quot;</ETag>"));
        assert_eq!(find_first(&doc, "ETag").as_deref(), Some("\"abc\""));
    }
}
