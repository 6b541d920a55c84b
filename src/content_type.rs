//! Maps artifact file names to the MIME type served to clients.

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_XML: &str = "text/xml";
pub const TEXT_PLAIN: &str = "text/plain";

/// Resolve the content type for an artifact path from its file extension.
///
/// Unknown or missing extensions fall back to `application/octet-stream`.
pub fn resolve(path: &str) -> &'static str {
    match extension(path).map(|ext| ext.to_ascii_lowercase()).as_deref() {
        Some("jar" | "war" | "ear" | "zip" | "asc") => OCTET_STREAM,
        Some("pom" | "xml") => TEXT_XML,
        Some("md5" | "sha1" | "sha256" | "sha512" | "txt") => TEXT_PLAIN,
        _ => OCTET_STREAM,
    }
}

/// Extension of the final path segment.  A leading dot (hidden file) or a
/// trailing dot does not count as an extension.
fn extension(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let dot = file_name.rfind('.')?;
    if dot == 0 || dot == file_name.len() - 1 {
        return None;
    }
    Some(&file_name[dot + 1..])
}
