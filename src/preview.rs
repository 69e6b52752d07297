//! Pointer/preview discipline.
//!
//! Anything that may be large is stored as a blob and carried through state
//! as a pointer plus a bounded inline preview. Consumers read the full text
//! through the pointer and fall back to the preview when it cannot be
//! resolved.

use tracing::warn;

use crate::blob::{BlobRef, BlobStore};

pub const DEFAULT_PREVIEW_CHARS: usize = 2000;

/// Keep the first `max_chars` characters, marking how many were cut.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}…[truncated {} chars]", total - max_chars)
}

/// Store `bytes` and return the pointer plus a preview of their text.
pub async fn store_with_preview(
    blobs: &dyn BlobStore,
    bytes: &[u8],
    max_chars: usize,
) -> anyhow::Result<(BlobRef, String)> {
    let blob = blobs.put(bytes).await?;
    let preview = truncate_preview(&String::from_utf8_lossy(bytes), max_chars);
    Ok((blob, preview))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub text: String,
    /// The pointer was absent or unreadable and `text` is the preview.
    pub from_preview: bool,
}

/// Full text behind `pointer`, or `preview` if it cannot be loaded.
pub async fn resolve_output(
    blobs: &dyn BlobStore,
    pointer: Option<&str>,
    preview: &str,
) -> ResolvedOutput {
    let fallback = || ResolvedOutput {
        text: preview.to_string(),
        from_preview: true,
    };
    let Some(pointer) = pointer else {
        return fallback();
    };
    let blob = match pointer.parse::<BlobRef>() {
        Ok(blob) => blob,
        Err(e) => {
            warn!(pointer, error = %e, "unusable output pointer, using preview");
            return fallback();
        }
    };
    match blobs.get(&blob).await {
        Ok(Some(bytes)) => ResolvedOutput {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            from_preview: false,
        },
        Ok(None) => {
            warn!(%blob, "output blob missing, using preview");
            fallback()
        }
        Err(e) => {
            warn!(%blob, error = %e, "output blob unreadable, using preview");
            fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_preview("abc", 3), "abc");
        assert_eq!(truncate_preview("", 0), "");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld";
        let preview = truncate_preview(text, 4);
        assert_eq!(preview, "héll…[truncated 7 chars]");
    }

    #[tokio::test]
    async fn resolves_full_text_through_pointer() {
        let blobs = MemoryBlobStore::new();
        let long = "line\n".repeat(1000);
        let (blob, preview) = store_with_preview(&blobs, long.as_bytes(), 20).await.unwrap();
        assert!(preview.len() < long.len());

        let resolved = resolve_output(&blobs, Some(blob.as_str()), &preview).await;
        assert!(!resolved.from_preview);
        assert_eq!(resolved.text, long);
    }

    #[tokio::test]
    async fn falls_back_to_preview_when_pointer_is_unavailable() {
        let blobs = MemoryBlobStore::new();
        let dangling = BlobRef::for_bytes(b"gone");

        for pointer in [None, Some("not-a-ref"), Some(dangling.as_str())] {
            let resolved = resolve_output(&blobs, pointer, "preview").await;
            assert!(resolved.from_preview, "{pointer:?}");
            assert_eq!(resolved.text, "preview");
        }
    }
}
