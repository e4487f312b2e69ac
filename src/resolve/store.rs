//! Writing acquired payloads into the case directory.

use std::io::ErrorKind;

use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::context::CaseContext;
use super::filename::{candidate_stem, category_default_extension, extension_of};
use super::{AcquiredResource, Candidate, ResolveError};
use crate::sniff;

/// Attempts before giving up on finding a free name on disk.
const MAX_CREATE_ATTEMPTS: usize = 16;

/// Bytes plus whatever the source told us about them.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    /// Where the bytes came from.
    pub source_url: &'a str,
    /// Content.
    pub body: &'a [u8],
    /// Declared content type.
    pub content_type: Option<&'a str>,
    /// Filename suggested by Content-Disposition or the browser.
    pub suggested_name: Option<&'a str>,
}

/// Chooses the extension: content type, then suggested filename, then file
/// signature, then the category default.
#[must_use]
pub fn choose_extension(payload: &Payload<'_>, category: &str) -> String {
    payload
        .content_type
        .and_then(sniff::extension_from_content_type)
        .map(str::to_string)
        .or_else(|| payload.suggested_name.and_then(extension_of))
        .or_else(|| sniff::detect_signature(payload.body).map(str::to_string))
        .unwrap_or_else(|| category_default_extension(category).to_string())
}

/// Lowercase hex SHA-256.
#[must_use]
pub fn sha256_hex(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

/// Writes `payload` under a fresh name reserved in the case registry.
///
/// Files are opened with create-new semantics; an existing file is never
/// overwritten, a new name is reserved instead.
///
/// # Errors
///
/// Returns [`ResolveError::Filesystem`] if the directory cannot be created or
/// the file cannot be written.
#[instrument(skip(ctx, candidate, payload), fields(label = %candidate.label, bytes = payload.body.len()))]
pub async fn persist(
    ctx: &mut CaseContext,
    candidate: &Candidate,
    payload: Payload<'_>,
) -> Result<AcquiredResource, ResolveError> {
    let category = candidate.category_or_unknown();
    let stem = candidate_stem(category, &candidate.label);
    let extension = choose_extension(&payload, category);

    // Fill header gaps from what this case already saw for the URL.
    let observed = ctx.observed(payload.source_url).cloned();
    let content_type = payload
        .content_type
        .map(str::to_string)
        .or_else(|| observed.and_then(|meta| meta.content_type));

    tokio::fs::create_dir_all(ctx.case_dir())
        .await
        .map_err(|e| ResolveError::filesystem(ctx.case_dir(), e))?;

    for _ in 0..MAX_CREATE_ATTEMPTS {
        let file_name = ctx.registry_mut().reserve(&stem, &extension);
        let path = ctx.case_dir().join(&file_name);

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "name taken on disk, reserving another");
                continue;
            }
            Err(e) => return Err(ResolveError::filesystem(path, e)),
        };

        let written = match file.write_all(payload.body).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ResolveError::filesystem(path, e));
        }

        info!(path = %path.display(), bytes = payload.body.len(), "document saved");
        return Ok(AcquiredResource {
            file_name,
            size: payload.body.len() as u64,
            content_type,
            extension,
            sha256: sha256_hex(payload.body),
        });
    }

    Err(ResolveError::filesystem(
        ctx.case_dir().join(&stem),
        std::io::Error::new(ErrorKind::AlreadyExists, "no free file name"),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::resolve::ActionRef;

    fn candidate() -> Candidate {
        Candidate::file("감정평가서", ActionRef::new("#ap")).with_category("AP")
    }

    fn payload(body: &[u8]) -> Payload<'_> {
        Payload {
            source_url: "https://a.example/ap",
            body,
            content_type: Some("application/pdf"),
            suggested_name: None,
        }
    }

    #[test]
    fn test_choose_extension_chain() {
        let body = b"%PDF-1.4";
        let mut p = payload(body);
        assert_eq!(choose_extension(&p, "AP"), "pdf");

        p.content_type = Some("application/octet-stream");
        p.suggested_name = Some("scan.HWP");
        assert_eq!(choose_extension(&p, "AP"), "hwp");

        p.suggested_name = None;
        assert_eq!(choose_extension(&p, "AP"), "pdf");

        let opaque = [0u8; 8];
        let p = Payload {
            body: &opaque,
            content_type: None,
            ..payload(body)
        };
        assert_eq!(choose_extension(&p, "PHOTO"), "jpg");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_persist_writes_and_hashes() {
        let dir = TempDir::new().unwrap();
        let mut ctx = CaseContext::new(dir.path().join("case-1"), "https://a.example/case");
        let body = vec![7u8; 2048];

        let acquired = persist(&mut ctx, &candidate(), payload(&body)).await.unwrap();

        assert_eq!(acquired.file_name, "AP_감정평가서.pdf");
        assert_eq!(acquired.size, 2048);
        assert_eq!(acquired.extension, "pdf");
        assert_eq!(acquired.sha256, sha256_hex(&body));
        let on_disk = std::fs::read(dir.path().join("case-1").join(&acquired.file_name)).unwrap();
        assert_eq!(on_disk, body);
    }

    #[tokio::test]
    async fn test_persist_never_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AP_감정평가서.pdf"), b"earlier run").unwrap();
        let mut ctx = CaseContext::new(dir.path(), "https://a.example/case");

        let acquired = persist(&mut ctx, &candidate(), payload(b"new bytes"))
            .await
            .unwrap();

        assert_eq!(acquired.file_name, "AP_감정평가서_2.pdf");
        let earlier = std::fs::read(dir.path().join("AP_감정평가서.pdf")).unwrap();
        assert_eq!(earlier, b"earlier run");
    }

    #[tokio::test]
    async fn test_persist_uses_observed_content_type() {
        let dir = TempDir::new().unwrap();
        let mut ctx = CaseContext::new(dir.path(), "https://a.example/case");
        ctx.observe(
            "https://a.example/ap",
            crate::resolve::ObservedMeta {
                content_type: Some("application/pdf".to_string()),
                disposition_filename: None,
            },
        );
        let p = Payload {
            content_type: None,
            ..payload(b"%PDF-1.4")
        };
        let acquired = persist(&mut ctx, &candidate(), p).await.unwrap();
        assert_eq!(acquired.content_type.as_deref(), Some("application/pdf"));
    }
}
