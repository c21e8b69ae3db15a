use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use md5::{Digest, Md5};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, RunnerError};

use super::{has_allowed_extension, SavedUpload, Storage};

const HASH_CHUNK_SIZE: usize = 64 * 1024;
const MOVE_MAX_TRIES: usize = 50;

/// Local-filesystem backend rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    http: reqwest::Client,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            http: reqwest::Client::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths live under the root; absolute paths address the local
    /// filesystem directly (scratch directories).
    fn locate(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    fn relative_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    async fn stage_path(&self, client_id: &str, name: &str) -> Result<PathBuf> {
        let staging = self.root.join(client_id).join("_tmp");
        fs::create_dir_all(&staging).await?;
        Ok(staging.join(format!("{}-{}", Uuid::new_v4().simple(), name)))
    }

    async fn fetch_https(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(RunnerError::storage)?
            .error_for_status()
            .map_err(RunnerError::storage)?;
        let body = response.bytes().await.map_err(RunnerError::storage)?;
        Ok(body.to_vec())
    }

    /// Claim `dst` without ever overwriting: atomic hard-link first, rename
    /// as the cross-filesystem fallback.
    fn claim_exclusive(src: &Path, dst: &Path) -> Result<()> {
        if dst.exists() {
            return Err(RunnerError::storage(format!(
                "destination already exists: {}",
                dst.display()
            )));
        }
        match std::fs::hard_link(src, dst) {
            Ok(()) => {
                std::fs::remove_file(src)?;
                Ok(())
            }
            Err(_) => {
                std::fs::rename(src, dst)?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save_upload(
        &self,
        client_id: &str,
        original_name: &str,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<SavedUpload> {
        if original_name.is_empty() || !has_allowed_extension(original_name) {
            return Err(RunnerError::invalid_input("Invalid file type"));
        }
        let dst = self.stage_path(client_id, original_name).await?;
        let mut file = fs::File::create(&dst).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            file.write_all(&buf[..read]).await?;
        }
        file.flush().await?;
        Ok(SavedUpload {
            digest: hex::encode(hasher.finalize()),
            path: self.relative_of(&dst),
        })
    }

    async fn fetch_url(
        &self,
        client_id: &str,
        url: &str,
        filename: &str,
    ) -> Result<SavedUpload> {
        let parsed = url::Url::parse(url)
            .map_err(|_| RunnerError::invalid_input("Invalid file URL"))?;
        let bytes = match parsed.scheme() {
            "https" => self.fetch_https(url).await?,
            "s3" => fetch_s3(&parsed).await?,
            "ftps" => {
                let parsed = parsed.clone();
                tokio::task::spawn_blocking(move || fetch_ftps(&parsed))
                    .await
                    .map_err(|e| RunnerError::internal(e.to_string()))??
            }
            "sftp" => {
                let parsed = parsed.clone();
                tokio::task::spawn_blocking(move || fetch_sftp(&parsed))
                    .await
                    .map_err(|e| RunnerError::internal(e.to_string()))??
            }
            other => {
                return Err(RunnerError::storage(format!(
                    "unsupported URL scheme: {other}"
                )));
            }
        };
        self.save_upload(
            client_id,
            filename,
            Box::new(std::io::Cursor::new(bytes)),
        )
        .await
    }

    async fn move_file(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.locate(src);
        let dst = self.locate(dst);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        tokio::task::spawn_blocking(move || Self::claim_exclusive(&src, &dst))
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?
    }

    async fn move_to_random_name(&self, src: &str) -> Result<String> {
        let src_path = self.locate(src);
        let dir = src_path
            .parent()
            .ok_or_else(|| RunnerError::storage("source has no parent"))?
            .to_path_buf();
        let stem = src_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = src_path
            .extension()
            .map(|s| format!(".{}", s.to_string_lossy()))
            .unwrap_or_default();
        for _ in 0..MOVE_MAX_TRIES {
            let nonce = Uuid::new_v4().simple().to_string();
            let dst = dir.join(format!("{stem}-{}{suffix}", &nonce[..12]));
            let src_clone = src_path.clone();
            let dst_clone = dst.clone();
            let claimed = tokio::task::spawn_blocking(move || {
                Self::claim_exclusive(&src_clone, &dst_clone)
            })
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?;
            if claimed.is_ok() {
                return Ok(self.relative_of(&dst));
            }
        }
        Err(RunnerError::storage(
            "could not claim a unique destination name",
        ))
    }

    async fn copy_file(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.locate(src);
        let dst = self.locate(dst);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&src, &dst).await?;
        Ok(())
    }

    async fn copy_folder(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.locate(src);
        let dst = self.locate(dst);
        tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.locate(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_folder(&self, path: &str) -> Result<()> {
        match fs::remove_dir_all(self.locate(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.locate(path);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn hash(&self, path: &str) -> Result<String> {
        let path = self.locate(path);
        let mut file = fs::File::open(&path).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    async fn download_archive(
        &self,
        client_id: &str,
        task_id: &str,
    ) -> Result<NamedTempFile> {
        let task_dir = self.root.join(client_id).join(task_id);
        if !task_dir.is_dir() {
            return Err(RunnerError::NotFound("Task archive".to_string()));
        }
        tokio::task::spawn_blocking(move || zip_directory(&task_dir))
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?
    }

    fn resolve(&self, relative: &str) -> Option<String> {
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                // Anything that could climb out of the root is rejected.
                Component::ParentDir
                | Component::RootDir
                | Component::Prefix(_) => return None,
            }
        }
        debug_assert!(resolved.starts_with(&self.root));
        Some(resolved.to_string_lossy().into_owned())
    }

    async fn is_file(&self, path: &str) -> bool {
        fs::metadata(self.locate(path))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn is_dir(&self, path: &str) -> bool {
        fs::metadata(self.locate(path))
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

async fn fetch_s3(url: &url::Url) -> Result<Vec<u8>> {
    let (bucket, key) = s3_parts(url)?;
    let config =
        aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
    let client = aws_sdk_s3::Client::new(&config);
    let object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(RunnerError::storage)?;
    let data = object.body.collect().await.map_err(RunnerError::storage)?;
    Ok(data.into_bytes().to_vec())
}

fn s3_parts(url: &url::Url) -> Result<(String, String)> {
    let bucket = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| RunnerError::invalid_input("Invalid file URL"))?;
    let key = url.path().trim_start_matches('/');
    if key.is_empty() {
        return Err(RunnerError::invalid_input("Invalid file URL"));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Explicit FTPS (AUTH TLS) fetch; anonymous unless the URL carries
/// credentials. Runs on the blocking pool.
fn fetch_ftps(url: &url::Url) -> Result<Vec<u8>> {
    use suppaftp::{NativeTlsConnector, NativeTlsFtpStream};

    let host = url
        .host_str()
        .ok_or_else(|| RunnerError::invalid_input("Invalid file URL"))?;
    let port = url.port().unwrap_or(21);
    let user = match url.username() {
        "" => "anonymous",
        user => user,
    };
    let password = url.password().unwrap_or("anonymous");

    let stream = NativeTlsFtpStream::connect((host, port))
        .map_err(RunnerError::storage)?;
    let connector = NativeTlsConnector::from(
        suppaftp::native_tls::TlsConnector::new()
            .map_err(RunnerError::storage)?,
    );
    let mut stream = stream
        .into_secure(connector, host)
        .map_err(RunnerError::storage)?;
    stream.login(user, password).map_err(RunnerError::storage)?;
    let buffer = stream
        .retr_as_buffer(url.path())
        .map_err(RunnerError::storage)?;
    let _ = stream.quit();
    Ok(buffer.into_inner())
}

/// SFTP fetch; password auth when the URL carries one, the SSH agent
/// otherwise. Runs on the blocking pool.
fn fetch_sftp(url: &url::Url) -> Result<Vec<u8>> {
    use std::io::Read as _;

    let host = url
        .host_str()
        .ok_or_else(|| RunnerError::invalid_input("Invalid file URL"))?;
    let port = url.port().unwrap_or(22);
    let tcp = std::net::TcpStream::connect((host, port))?;
    let mut session = ssh2::Session::new().map_err(RunnerError::storage)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(RunnerError::storage)?;

    let user = match url.username() {
        "" => "anonymous",
        user => user,
    };
    match url.password() {
        Some(password) => session
            .userauth_password(user, password)
            .map_err(RunnerError::storage)?,
        None => session.userauth_agent(user).map_err(RunnerError::storage)?,
    }
    let sftp = session.sftp().map_err(RunnerError::storage)?;
    let mut file = sftp
        .open(Path::new(url.path()))
        .map_err(RunnerError::storage)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(RunnerError::storage)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(RunnerError::storage)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        } else {
            debug!("skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(())
}

fn zip_directory(dir: &Path) -> Result<NamedTempFile> {
    let file = NamedTempFile::new()?;
    let mut writer = zip::ZipWriter::new(file.reopen()?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(RunnerError::storage)?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(RunnerError::storage)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{name}/"), options)
                .map_err(RunnerError::storage)?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(name, options)
                .map_err(RunnerError::storage)?;
            let mut source = std::fs::File::open(entry.path())?;
            std::io::copy(&mut source, &mut writer)?;
        } else {
            warn!("not archiving {}", entry.path().display());
        }
    }
    writer.finish().map_err(RunnerError::storage)?.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    fn reader(bytes: &[u8]) -> Box<dyn AsyncRead + Send + Unpin> {
        Box::new(std::io::Cursor::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn save_upload_stages_and_hashes() {
        let (_dir, storage) = storage();
        let saved = storage
            .save_upload("client-1", "flow.waldiez", reader(b"{}"))
            .await
            .unwrap();
        // md5("{}")
        assert_eq!(saved.digest, "99914b932bd37a50b983c5e7c90ae93b");
        assert!(saved.path.starts_with("client-1/_tmp/"));
        assert!(storage.is_file(&saved.path).await);
    }

    #[tokio::test]
    async fn save_upload_rejects_bad_extensions() {
        let (_dir, storage) = storage();
        let err = storage
            .save_upload("client-1", "flow.exe", reader(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn move_file_never_overwrites() {
        let (_dir, storage) = storage();
        let first = storage
            .save_upload("c", "a.json", reader(b"1"))
            .await
            .unwrap();
        let second = storage
            .save_upload("c", "a.json", reader(b"2"))
            .await
            .unwrap();
        storage.move_file(&first.path, "c/t1/a.json").await.unwrap();
        let err = storage
            .move_file(&second.path, "c/t1/a.json")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Storage(_)));
        assert_eq!(storage.hash("c/t1/a.json").await.unwrap(), first.digest);
    }

    #[tokio::test]
    async fn move_to_random_name_keeps_extension() {
        let (_dir, storage) = storage();
        let saved = storage
            .save_upload("c", "flow.waldiez", reader(b"{}"))
            .await
            .unwrap();
        let moved = storage.move_to_random_name(&saved.path).await.unwrap();
        assert_ne!(moved, saved.path);
        assert!(moved.ends_with(".waldiez"));
        assert!(!storage.is_file(&saved.path).await);
        assert!(storage.is_file(&moved).await);
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let (_dir, storage) = storage();
        storage.delete_file("nope/missing.json").await.unwrap();
        storage.delete_folder("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_files_is_shallow_and_tolerant() {
        let (_dir, storage) = storage();
        assert!(storage.list_files("absent").await.unwrap().is_empty());
        let saved = storage
            .save_upload("c", "a.json", reader(b"1"))
            .await
            .unwrap();
        storage.move_file(&saved.path, "c/t/a.json").await.unwrap();
        let saved = storage
            .save_upload("c", "b.json", reader(b"2"))
            .await
            .unwrap();
        storage.move_file(&saved.path, "c/t/sub/b.json").await.unwrap();
        assert_eq!(storage.list_files("c/t").await.unwrap(), vec!["a.json"]);
    }

    #[test]
    fn s3_urls_split_into_bucket_and_key() {
        let url =
            url::Url::parse("s3://my-bucket/flows/demo.waldiez").unwrap();
        let (bucket, key) = s3_parts(&url).unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "flows/demo.waldiez");

        let url = url::Url::parse("s3://my-bucket").unwrap();
        assert!(s3_parts(&url).is_err());
        let url = url::Url::parse("s3://my-bucket/").unwrap();
        assert!(s3_parts(&url).is_err());
    }

    #[tokio::test]
    async fn fetch_url_rejects_unsupported_schemes() {
        let (_dir, storage) = storage();
        for url in ["http://host/f.waldiez", "file:///etc/passwd"] {
            let err = storage
                .fetch_url("c1", url, "f.waldiez")
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::Storage(_)), "{url}");
        }
        let err = storage
            .fetch_url("c1", "not a url", "f.waldiez")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput(_)));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let (_dir, storage) = storage();
        assert!(storage.resolve("c/flow.waldiez").is_some());
        assert!(storage.resolve("../outside").is_none());
        assert!(storage.resolve("c/../../outside").is_none());
        assert!(storage.resolve("/etc/passwd").is_none());
    }

    #[tokio::test]
    async fn archive_contains_task_files() {
        let (_dir, storage) = storage();
        let saved = storage
            .save_upload("c", "flow.waldiez", reader(b"{}"))
            .await
            .unwrap();
        storage
            .move_file(&saved.path, "c/t1/flow.waldiez")
            .await
            .unwrap();
        let archive = storage.download_archive("c", "t1").await.unwrap();
        let mut zip =
            zip::ZipArchive::new(archive.reopen().unwrap()).unwrap();
        let names: Vec<String> =
            (0..zip.len()).map(|i| zip.by_index(i).unwrap().name().to_string()).collect();
        assert!(names.contains(&"flow.waldiez".to_string()));
    }

    #[tokio::test]
    async fn archive_of_missing_task_is_not_found() {
        let (_dir, storage) = storage();
        let err = storage.download_archive("c", "zzz").await.unwrap_err();
        assert!(matches!(err, RunnerError::NotFound(_)));
    }
}
