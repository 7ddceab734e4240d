//! File read/write and directory inspection

use super::HandlerContext;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Lowercase hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
    Other,
}

impl EntryType {
    fn of(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_dir() {
            EntryType::Directory
        } else if ft.is_file() {
            EntryType::File
        } else {
            EntryType::Other
        }
    }
}

fn modified_ms(meta: &Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

// ============================================================================
// readFile
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadFileResponse {
    pub success: bool,
    /// Base64 file content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn read_file(ctx: Arc<HandlerContext>, req: ReadFileRequest) -> ReadFileResponse {
    let path = match ctx.policy.resolve_existing(&req.path) {
        Ok(path) => path,
        Err(e) => return ReadFileResponse::failed(e.to_string()),
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ReadFileResponse {
            success: true,
            content: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            error: None,
        },
        Err(e) => ReadFileResponse::failed(format!("Failed to read {}: {}", req.path, e)),
    }
}

impl ReadFileResponse {
    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

// ============================================================================
// writeFile
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileRequest {
    pub path: String,
    /// Base64 file content
    pub content: String,
    /// `None` means the file must not exist yet
    #[serde(default)]
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteFileResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WriteFileResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Write with optimistic concurrency on the content hash
pub async fn write_file(ctx: Arc<HandlerContext>, req: WriteFileRequest) -> WriteFileResponse {
    let path = match ctx.policy.resolve_write(&req.path) {
        Ok(path) => path,
        Err(e) => return WriteFileResponse::failed(e.to_string()),
    };
    let bytes = match base64::engine::general_purpose::STANDARD.decode(req.content.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => return WriteFileResponse::failed(format!("Invalid base64 content: {}", e)),
    };

    let current = match tokio::fs::read(&path).await {
        Ok(existing) => Some(content_hash(&existing)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return WriteFileResponse::failed(format!("Failed to read {}: {}", req.path, e)),
    };

    match (req.expected_hash.as_deref(), current.as_deref()) {
        (None, Some(_)) => {
            return WriteFileResponse::failed("File already exists but was expected to be new")
        }
        (Some(_), None) => {
            return WriteFileResponse::failed("File does not exist but hash was provided")
        }
        (Some(expected), Some(actual)) if !expected.eq_ignore_ascii_case(actual) => {
            return WriteFileResponse::failed(format!(
                "File hash mismatch. Expected: {}, Actual: {}",
                expected, actual
            ));
        }
        _ => {}
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return WriteFileResponse::failed(format!("Failed to create directory: {}", e));
        }
    }
    if let Err(e) = tokio::fs::write(&path, &bytes).await {
        return WriteFileResponse::failed(format!("Failed to write {}: {}", req.path, e));
    }

    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Remote file written");
    WriteFileResponse {
        success: true,
        hash: Some(content_hash(&bytes)),
        error: None,
    }
}

// ============================================================================
// listDirectory
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ListDirectoryRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Milliseconds since the epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListDirectoryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<DirectoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn sort_entries<T>(entries: &mut [T], key: impl Fn(&T) -> (EntryType, &str)) {
    entries.sort_by(|a, b| {
        let (ta, na) = key(a);
        let (tb, nb) = key(b);
        let da = ta != EntryType::Directory;
        let db = tb != EntryType::Directory;
        da.cmp(&db).then_with(|| na.cmp(nb))
    });
}

pub async fn list_directory(
    ctx: Arc<HandlerContext>,
    req: ListDirectoryRequest,
) -> ListDirectoryResponse {
    let dir = match ctx.policy.resolve_dir(Some(&req.path)) {
        Ok(dir) => dir,
        Err(e) => {
            return ListDirectoryResponse {
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };

    let mut reader = match tokio::fs::read_dir(&dir).await {
        Ok(reader) => reader,
        Err(e) => {
            return ListDirectoryResponse {
                error: Some(format!("Failed to read directory: {}", e)),
                ..Default::default()
            }
        }
    };

    let mut entries = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        // Does not follow symlinks; those list as `other`.
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(entry = ?entry.path(), "Skipping entry: {}", e);
                continue;
            }
        };
        let entry_type = EntryType::of(&meta);
        entries.push(DirectoryEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            entry_type,
            size: (entry_type == EntryType::File).then(|| meta.len()),
            modified: modified_ms(&meta),
        });
    }
    sort_entries(&mut entries, |e| (e.entry_type, e.name.as_str()));

    ListDirectoryResponse {
        success: true,
        entries: Some(entries),
        error: None,
    }
}

// ============================================================================
// getDirectoryTree
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryTreeRequest {
    pub path: String,
    pub max_depth: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryTreeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<TreeNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DirectoryTreeResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

pub async fn get_directory_tree(
    ctx: Arc<HandlerContext>,
    req: DirectoryTreeRequest,
) -> DirectoryTreeResponse {
    if req.max_depth < 0 {
        return DirectoryTreeResponse::failed("maxDepth must be non-negative");
    }
    let root = match ctx.policy.resolve_existing(&req.path) {
        Ok(root) => root,
        Err(e) => return DirectoryTreeResponse::failed(e.to_string()),
    };
    let max_depth = req.max_depth as u64;

    let built = tokio::task::spawn_blocking(move || build_node(&root, 0, max_depth)).await;
    match built {
        Ok(Some(tree)) => DirectoryTreeResponse {
            success: true,
            tree: Some(tree),
            error: None,
        },
        Ok(None) => DirectoryTreeResponse::failed(format!("Cannot stat {}", req.path)),
        Err(e) => DirectoryTreeResponse::failed(format!("Tree traversal failed: {}", e)),
    }
}

/// Build one node; `None` for symlinks and entries that cannot be stat'ed
fn build_node(path: &Path, depth: u64, max_depth: u64) -> Option<TreeNode> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() {
        return None;
    }
    let entry_type = EntryType::of(&meta);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let children = if entry_type == EntryType::Directory && depth < max_depth {
        let mut children: Vec<TreeNode> = match std::fs::read_dir(path) {
            Ok(reader) => reader
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| build_node(&entry.path(), depth + 1, max_depth))
                .collect(),
            Err(e) => {
                tracing::debug!(path = %path.display(), "Cannot read directory: {}", e);
                Vec::new()
            }
        };
        sort_entries(&mut children, |n| (n.entry_type, n.name.as_str()));
        Some(children)
    } else {
        None
    };

    Some(TreeNode {
        name,
        path: path.display().to_string(),
        entry_type,
        size: (entry_type == EntryType::File).then(|| meta.len()),
        modified: modified_ms(&meta),
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::context;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn write_req(path: &str, content: &str, expected: Option<&str>) -> WriteFileRequest {
        WriteFileRequest {
            path: path.to_string(),
            content: b64(content),
            expected_hash: expected.map(String::from),
        }
    }

    #[test]
    fn test_content_hash_is_lowercase_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_write_file_optimistic_concurrency() {
        let (dir, ctx) = context();

        let first = write_file(ctx.clone(), write_req("notes.txt", "v1", None)).await;
        assert!(first.success, "{:?}", first.error);
        let h1 = first.hash.unwrap();

        let second = write_file(ctx.clone(), write_req("notes.txt", "v2", Some(&h1))).await;
        assert!(second.success);
        let h2 = second.hash.unwrap();
        assert_ne!(h1, h2);

        let stale = write_file(ctx.clone(), write_req("notes.txt", "v3", Some(&h1))).await;
        assert!(!stale.success);
        assert!(stale.error.unwrap().starts_with("File hash mismatch"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "v2"
        );

        let again_new = write_file(ctx.clone(), write_req("notes.txt", "v4", None)).await;
        assert_eq!(
            again_new.error.as_deref(),
            Some("File already exists but was expected to be new")
        );

        let missing = write_file(ctx, write_req("absent.txt", "x", Some(&h2))).await;
        assert_eq!(
            missing.error.as_deref(),
            Some("File does not exist but hash was provided")
        );
        assert!(!dir.path().join("absent.txt").exists());
    }

    #[tokio::test]
    async fn test_write_file_outside_root_has_no_side_effect() {
        let (dir, ctx) = context();
        let resp = write_file(ctx, write_req("../escape.txt", "x", None)).await;
        assert!(!resp.success);
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_dangling_symlink_stays_in_root() {
        let (dir, ctx) = context();
        let outside = tempfile::TempDir::new().unwrap();
        let target = outside.path().join("pwned.txt");
        std::os::unix::fs::symlink(&target, dir.path().join("link.txt")).unwrap();

        let resp = write_file(ctx, write_req("link.txt", "escaped", None)).await;
        assert!(!resp.success);
        assert!(resp.error.is_some());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_read_file_returns_base64() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let resp = read_file(
            ctx.clone(),
            ReadFileRequest {
                path: "a.txt".to_string(),
            },
        )
        .await;
        assert!(resp.success);
        assert_eq!(resp.content.unwrap(), b64("hello"));

        let missing = read_file(
            ctx,
            ReadFileRequest {
                path: "nope.txt".to_string(),
            },
        )
        .await;
        assert!(!missing.success);
        assert!(missing.error.is_some());
    }

    #[tokio::test]
    async fn test_list_directory_sorts_directories_first() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("b.txt"), "12345").unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        std::fs::create_dir(dir.path().join("zdir")).unwrap();

        let resp = list_directory(
            ctx,
            ListDirectoryRequest {
                path: ".".to_string(),
            },
        )
        .await;
        assert!(resp.success);
        let entries = resp.entries.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "a.txt", "b.txt"]);
        assert_eq!(entries[0].entry_type, EntryType::Directory);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[2].size, Some(5));
        assert!(entries[2].modified.unwrap() > 0);
    }

    fn tree_fixture(dir: &Path) {
        std::fs::create_dir_all(dir.join("src/nested/deep")).unwrap();
        std::fs::write(dir.join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.join("src/nested/deep/x.rs"), "").unwrap();
        std::fs::write(dir.join("README.md"), "# hi").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.join("README.md"), dir.join("link.md")).unwrap();
    }

    fn max_depth(node: &TreeNode) -> usize {
        node.children
            .as_ref()
            .map(|c| 1 + c.iter().map(max_depth).max().unwrap_or(0))
            .unwrap_or(0)
    }

    fn names(node: &TreeNode) -> Vec<String> {
        let mut out = vec![node.name.clone()];
        for child in node.children.iter().flatten() {
            out.extend(names(child));
        }
        out
    }

    #[tokio::test]
    async fn test_directory_tree_depth_zero_has_no_children() {
        let (dir, ctx) = context();
        tree_fixture(dir.path());
        let resp = get_directory_tree(
            ctx,
            DirectoryTreeRequest {
                path: ".".to_string(),
                max_depth: 0,
            },
        )
        .await;
        let tree = resp.tree.unwrap();
        assert!(tree.children.is_none());
        let json = serde_json::to_value(&tree).unwrap();
        assert!(json.get("children").is_none());
        assert_eq!(json["type"], "directory");
    }

    #[tokio::test]
    async fn test_directory_tree_respects_depth_and_skips_symlinks() {
        let (dir, ctx) = context();
        tree_fixture(dir.path());
        let resp = get_directory_tree(
            ctx,
            DirectoryTreeRequest {
                path: ".".to_string(),
                max_depth: 2,
            },
        )
        .await;
        let tree = resp.tree.unwrap();
        assert!(max_depth(&tree) <= 2);

        let all = names(&tree);
        assert!(!all.contains(&"link.md".to_string()));
        assert!(all.contains(&"lib.rs".to_string()));
        assert!(!all.contains(&"deep".to_string()));

        let top: Vec<&str> = tree
            .children
            .as_ref()
            .unwrap()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(top, vec!["src", "README.md"]);
    }

    #[tokio::test]
    async fn test_directory_tree_rejects_negative_depth() {
        let (_dir, ctx) = context();
        let resp = get_directory_tree(
            ctx,
            DirectoryTreeRequest {
                path: ".".to_string(),
                max_depth: -1,
            },
        )
        .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("non-negative"));
    }
}
