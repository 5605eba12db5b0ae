use mime_guess::from_path;

/// Fallback content type for names without a known extension.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Maps a file name to a content type by its extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeResolver;

impl MimeResolver {
    pub fn resolve(&self, file_name: &str) -> String {
        from_path(file_name).first_or_octet_stream().to_string()
    }

    /// Prefer an explicit, non-empty mime type reported by the upstream source.
    pub fn resolve_or(&self, file_name: &str, explicit: Option<&str>) -> String {
        match explicit.map(str::trim) {
            Some(mime) if !mime.is_empty() && mime != OCTET_STREAM => mime.to_string(),
            _ => self.resolve(file_name),
        }
    }
}
