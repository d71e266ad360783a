//! Per-instance code directories

use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

use crate::function::FunctionDefinition;
use crate::invocation::InvocationError;

/// Code directory of one instance. An extracted artifact is deleted when
/// the value is dropped.
pub struct CodeDir {
    path: PathBuf,
    _extracted: Option<TempDir>,
}

impl CodeDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolve the code directory for a new instance, extracting the packaged
/// artifact into a private temporary directory when one is declared
pub async fn prepare(function: &FunctionDefinition) -> Result<CodeDir, InvocationError> {
    let Some(artifact) = function.artifact.clone() else {
        return Ok(CodeDir {
            path: function.code_dir.clone(),
            _extracted: None,
        });
    };

    let key = function.key.clone();
    tokio::task::spawn_blocking(move || extract(&key, &artifact))
        .await
        .map_err(|e| InvocationError::transport(format!("Artifact extraction panicked: {e}")))?
}

fn extract(key: &str, artifact: &Path) -> Result<CodeDir, InvocationError> {
    let fail = |e: &dyn std::fmt::Display| {
        InvocationError::transport(format!("Failed to extract {}: {e}", artifact.display()))
    };

    let dir = tempfile::Builder::new()
        .prefix(&format!("offstack-{key}-"))
        .tempdir()
        .map_err(|e| fail(&e))?;
    let file = File::open(artifact).map_err(|e| fail(&e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| fail(&e))?;
    archive.extract(dir.path()).map_err(|e| fail(&e))?;

    debug!(function = %key, artifact = %artifact.display(), dir = %dir.path().display(), "Extracted artifact");
    Ok(CodeDir {
        path: dir.path().to_path_buf(),
        _extracted: Some(dir),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Runtime;
    use std::io::Write;

    fn write_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("handler.js", zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(b"exports.hello = async () => 'hi'").unwrap();
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_without_artifact_uses_code_dir() {
        let mut def = FunctionDefinition::new("fn", "handler.hello", Runtime::Nodejs20);
        def.code_dir = PathBuf::from("/srv/app");
        let dir = prepare(&def).await.unwrap();
        assert_eq!(dir.path(), Path::new("/srv/app"));
    }

    #[tokio::test]
    async fn test_artifact_extracted_and_removed() {
        let scratch = tempfile::tempdir().unwrap();
        let artifact = scratch.path().join("fn.zip");
        write_zip(&artifact);

        let mut def = FunctionDefinition::new("fn", "handler.hello", Runtime::Nodejs20);
        def.artifact = Some(artifact);

        let dir = prepare(&def).await.unwrap();
        let extracted = dir.path().to_path_buf();
        assert!(extracted.join("handler.js").is_file());

        drop(dir);
        assert!(!extracted.exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_transport_error() {
        let mut def = FunctionDefinition::new("fn", "handler.hello", Runtime::Nodejs20);
        def.artifact = Some(PathBuf::from("/nonexistent/fn.zip"));
        assert!(prepare(&def).await.err().unwrap().is_transport());
    }
}
