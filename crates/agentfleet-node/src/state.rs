//! Local state file holding the node id assigned at registration.

use std::io;
use std::path::Path;

use agentfleet_core::NodeId;

/// Write `node_id` to `path`, replacing any previous content.
pub async fn save_node_id(path: &Path, node_id: &NodeId) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, format!("{node_id}\n")).await
}

/// The id saved by a previous run, if any.
pub async fn load_node_id(path: &Path) -> io::Result<Option<NodeId>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let id = contents.trim();
            Ok((!id.is_empty()).then(|| NodeId::new(id)))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("node-id");

        assert_eq!(load_node_id(&path).await.unwrap(), None);
        save_node_id(&path, &NodeId::new("3f9a1c2e")).await.unwrap();
        assert_eq!(load_node_id(&path).await.unwrap(), Some(NodeId::new("3f9a1c2e")));
    }
}
