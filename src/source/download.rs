//! Download source distributions and check them against their published checksum.

use std::path::{Path, PathBuf};

use fs_err as fs;
use reqwest_middleware::ClientWithMiddleware;
use tokio::io::AsyncWriteExt;

use super::{SourceArtifact, SourceError};
use crate::console_utils::LoggingOutputHandler;

/// Download `artifact` into `dest_dir` and validate it.
///
/// A file that is already present and matches the checksum is reused. The
/// download is staged in a temporary file next to the destination and only
/// moved into place once the checksum matches, so a failed or mismatching
/// download leaves nothing behind.
pub async fn fetch_source(
    client: &ClientWithMiddleware,
    artifact: &SourceArtifact,
    dest_dir: &Path,
    log_handler: &LoggingOutputHandler,
) -> Result<PathBuf, SourceError> {
    fs::create_dir_all(dest_dir)?;
    let destination = dest_dir.join(&artifact.filename);

    if destination.is_file() && artifact.checksum.validate(&destination)? {
        tracing::info!("Found valid source file {}", destination.display());
        return Ok(destination);
    }

    let staged = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(dest_dir)?;

    if artifact.url.scheme() == "file" {
        let local_path = artifact.url.to_file_path().map_err(|_| {
            SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid local file path",
            ))
        })?;
        fs::copy(&local_path, staged.path())?;
    } else {
        download(client, artifact, staged.path(), log_handler).await?;
    }

    if !artifact.checksum.validate(staged.path())? {
        return Err(SourceError::ChecksumMismatch {
            filename: artifact.filename.clone(),
        });
    }

    staged
        .persist(&destination)
        .map_err(|err| SourceError::Io(err.error))?;
    Ok(destination)
}

async fn download(
    client: &ClientWithMiddleware,
    artifact: &SourceArtifact,
    destination: &Path,
    log_handler: &LoggingOutputHandler,
) -> Result<(), SourceError> {
    let url = &artifact.url;
    let mut response =
        client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| SourceError::Download {
                url: url.clone(),
                source,
            })?;

    if !response.status().is_success() {
        return Err(SourceError::DownloadStatus {
            url: url.clone(),
            status: response.status(),
        });
    }

    let progress_bar = log_handler.add_progress_bar(
        indicatif::ProgressBar::new(response.content_length().unwrap_or(0))
            .with_prefix("Downloading")
            .with_style(log_handler.default_bytes_style()),
    );
    progress_bar.set_message(artifact.filename.clone());

    let mut file = tokio::fs::File::create(destination).await?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|source| SourceError::Stream {
            url: url.clone(),
            source,
        })?
    {
        progress_bar.inc(chunk.len() as u64);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    progress_bar.finish_and_clear();

    Ok(())
}

#[cfg(test)]
mod tests {
    use rattler_digest::{Sha256, compute_bytes_digest};
    use url::Url;

    use super::*;
    use crate::source::Checksum;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn local_artifact(path: &Path, contents: &[u8]) -> SourceArtifact {
        SourceArtifact {
            name: "sep".to_string(),
            version: "1.2.1".to_string(),
            url: Url::from_file_path(path).unwrap(),
            filename: "sep-1.2.1.tar.gz".to_string(),
            checksum: Checksum::Sha256(compute_bytes_digest::<Sha256>(contents)),
        }
    }

    fn remote_artifact(server: &MockServer, contents: &[u8]) -> SourceArtifact {
        SourceArtifact {
            url: Url::parse(&format!("{}/packages/sep-1.2.1.tar.gz", server.uri())).unwrap(),
            ..local_artifact(Path::new("/unused"), contents)
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn client() -> ClientWithMiddleware {
        reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build()
    }

    #[tokio::test]
    async fn valid_download_is_kept() {
        let upstream = tempfile::tempdir().unwrap();
        let original = upstream.path().join("original.tar.gz");
        fs::write(&original, b"source bytes").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let artifact = local_artifact(&original, b"source bytes");
        let path = fetch_source(&client(), &artifact, dest.path(), &LoggingOutputHandler::default())
            .await
            .unwrap();

        assert_eq!(path, dest.path().join("sep-1.2.1.tar.gz"));
        assert_eq!(fs::read(&path).unwrap(), b"source bytes");
    }

    #[tokio::test]
    async fn mismatching_download_is_deleted() {
        let upstream = tempfile::tempdir().unwrap();
        let original = upstream.path().join("original.tar.gz");
        fs::write(&original, b"tampered bytes").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let artifact = local_artifact(&original, b"source bytes");
        let err = fetch_source(&client(), &artifact, dest.path(), &LoggingOutputHandler::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::ChecksumMismatch { .. }));
        assert!(entries(dest.path()).is_empty());
    }

    #[tokio::test]
    async fn remote_download_is_moved_into_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/packages/sep-1.2.1.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"source bytes".to_vec()))
            .mount(&server)
            .await;

        let dest = tempfile::tempdir().unwrap();
        let artifact = remote_artifact(&server, b"source bytes");
        let path = fetch_source(&client(), &artifact, dest.path(), &LoggingOutputHandler::default())
            .await
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"source bytes");
        assert_eq!(entries(dest.path()), vec!["sep-1.2.1.tar.gz"]);
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/packages/sep-1.2.1.tar.gz"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dest = tempfile::tempdir().unwrap();
        let artifact = remote_artifact(&server, b"source bytes");
        let err = fetch_source(&client(), &artifact, dest.path(), &LoggingOutputHandler::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::DownloadStatus { .. }));
        assert!(entries(dest.path()).is_empty());
    }
}
