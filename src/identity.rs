//! # Node Identity
//!
//! Hierarchical identifiers for everything the cluster runs: the cluster
//! itself, one id per host agent, and one id per worker node. Every queue,
//! counter, and barrier path in the coordination backend is namespaced by one
//! of these, so free-form segments (cluster ids, hostnames, array and node
//! ids) are sanitized before they become path components.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};

/// Identifier of a host agent or a worker node within one cluster instance.
///
/// A host-level id carries `cluster_id` and `hostname` only; a node-level id
/// additionally carries the array id and the node's logical id within that
/// array. The derived `host_id()` is always a prefix of the derived
/// `node_path()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalNodeId {
    cluster_id: String,
    hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    array_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_id: Option<String>,
}

impl GlobalNodeId {
    /// Host-level identifier
    pub fn host(cluster_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            cluster_id: sanitize(&cluster_id.into()),
            hostname: sanitize(&hostname.into()),
            array_id: None,
            local_id: None,
        }
    }

    /// Node-level identifier
    pub fn node(
        cluster_id: impl Into<String>,
        hostname: impl Into<String>,
        array_id: impl Into<String>,
        local_id: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: sanitize(&cluster_id.into()),
            hostname: sanitize(&hostname.into()),
            array_id: Some(sanitize(&array_id.into())),
            local_id: Some(sanitize(&local_id.into())),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn array_id(&self) -> Option<&str> {
        self.array_id.as_deref()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    /// `clusterId/hostname`, the namespace segment shared by a host and all
    /// of its children
    pub fn host_id(&self) -> String {
        format!("{}/{}", self.cluster_id, self.hostname)
    }

    /// Full path of this id: `host_id` for hosts,
    /// `host_id/arrayId/localId` for nodes
    pub fn node_path(&self) -> String {
        match (&self.array_id, &self.local_id) {
            (Some(array_id), Some(local_id)) => {
                format!("{}/{array_id}/{local_id}", self.host_id())
            }
            _ => self.host_id(),
        }
    }

    /// The host-level id this id belongs to (identity for host-level ids)
    pub fn host_global_id(&self) -> GlobalNodeId {
        GlobalNodeId {
            cluster_id: self.cluster_id.clone(),
            hostname: self.hostname.clone(),
            array_id: None,
            local_id: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.array_id.is_none()
    }

    /// Parse a path produced by [`Self::node_path`] back into an id. Accepts
    /// two segments (host) or four (node); anything else is rejected.
    pub fn parse(path: &str) -> GridResult<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [cluster_id, hostname] => Ok(Self::host(*cluster_id, *hostname)),
            [cluster_id, hostname, array_id, local_id] => {
                Ok(Self::node(*cluster_id, *hostname, *array_id, *local_id))
            }
            _ => Err(GridError::config(format!(
                "node path '{path}' must have 2 or 4 segments, found {}",
                segments.len()
            ))),
        }
    }
}

impl fmt::Display for GlobalNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_path())
    }
}

/// Replace path separators in a free-form segment so it cannot escape its
/// level of the namespace hierarchy
pub fn sanitize(segment: &str) -> String {
    segment.replace([':', '/'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_host_id_is_prefix_of_node_path() {
        let node = GlobalNodeId::node("my-cluster", "localhost", "my-array", "1");
        assert_eq!(node.host_id(), "my-cluster/localhost");
        assert_eq!(node.node_path(), "my-cluster/localhost/my-array/1");
        assert!(node.node_path().starts_with(&node.host_id()));
    }

    #[test]
    fn test_host_global_id() {
        let node = GlobalNodeId::node("c", "h", "a", "0");
        let host = node.host_global_id();
        assert!(host.is_host());
        assert!(!node.is_host());
        assert_eq!(host, GlobalNodeId::host("c", "h"));
        assert_eq!(host.node_path(), "c/h");
    }

    #[test]
    fn test_sanitization_of_segments() {
        let id = GlobalNodeId::host("Cluster:Test/x", "local:host");
        assert_eq!(id.host_id(), "Cluster_Test_x/local_host");

        let node = GlobalNodeId::node("c", "h", "arr/ay", "n:1");
        assert_eq!(node.node_path(), "c/h/arr_ay/n_1");
    }

    #[test]
    fn test_equality_by_full_path() {
        let a = GlobalNodeId::node("c", "h", "a", "1");
        let b = GlobalNodeId::node("c", "h", "a", "1");
        let c = GlobalNodeId::node("c", "h", "a", "2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_inverts_node_path() {
        let node = GlobalNodeId::node("c", "localhost", "servers", "3");
        assert_eq!(GlobalNodeId::parse(&node.node_path()).unwrap(), node);

        let host = GlobalNodeId::host("c", "localhost");
        assert_eq!(GlobalNodeId::parse(&host.node_path()).unwrap(), host);

        assert!(GlobalNodeId::parse("only-one-segment").is_err());
        assert!(GlobalNodeId::parse("a/b/c").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let id = GlobalNodeId::node("c", "localhost", "servers", "3");
        let json = serde_json::to_string(&id).unwrap();
        let back: GlobalNodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);

        let host = GlobalNodeId::host("c", "localhost");
        let json = serde_json::to_string(&host).unwrap();
        assert!(!json.contains("array_id"));
    }

    proptest! {
        #[test]
        fn sanitize_never_leaves_separators(segment in ".*") {
            let cleaned = sanitize(&segment);
            prop_assert!(!cleaned.contains('/'));
            prop_assert!(!cleaned.contains(':'));
        }

        #[test]
        fn node_path_has_exactly_three_separators(
            cluster in "[a-zA-Z0-9:/_-]{1,20}",
            host in "[a-zA-Z0-9:/_-]{1,20}",
            array in "[a-zA-Z0-9:/_-]{1,20}",
            local in "[a-zA-Z0-9:/_-]{1,20}",
        ) {
            let id = GlobalNodeId::node(cluster, host, array, local);
            prop_assert_eq!(id.node_path().matches('/').count(), 3);
        }
    }
}
