use serde::{Deserialize, Serialize};

use crate::config::ScalingTargetConfiguration;
use crate::types::{DistanceSpace, KnnQuery, Label, VectorEntry};

/// One orchestrator RPC call.
///
/// ```json
/// {"databaseName": "docs", "secretToken": "...", "method": "query",
///  "args": {"vector": [0.1, 0.2], "k": 10}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorRequest {
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<String>,
    #[serde(flatten)]
    pub command: OrchestratorCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum OrchestratorCommand {
    Query(KnnQuery),
    AddVectors(AddVectorsArgs),
    RemoveVectors(RemoveVectorsArgs),
    Count,
    GetConfiguration,
    AddToken(TokenArgs),
    RemoveToken(TokenArgs),
    Auth,
    WakeUpWorkers,
    Flush,
    Initialize(InitializeArgs),
    Destroy,
    Ping,
}

impl OrchestratorCommand {
    pub fn method(&self) -> &'static str {
        match self {
            OrchestratorCommand::Query(_) => "query",
            OrchestratorCommand::AddVectors(_) => "addVectors",
            OrchestratorCommand::RemoveVectors(_) => "removeVectors",
            OrchestratorCommand::Count => "count",
            OrchestratorCommand::GetConfiguration => "getConfiguration",
            OrchestratorCommand::AddToken(_) => "addToken",
            OrchestratorCommand::RemoveToken(_) => "removeToken",
            OrchestratorCommand::Auth => "auth",
            OrchestratorCommand::WakeUpWorkers => "wakeUpWorkers",
            OrchestratorCommand::Flush => "flush",
            OrchestratorCommand::Initialize(_) => "initialize",
            OrchestratorCommand::Destroy => "destroy",
            OrchestratorCommand::Ping => "ping",
        }
    }

    /// Commands callers may issue without a token even on protected
    /// databases.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            OrchestratorCommand::Ping | OrchestratorCommand::Auth | OrchestratorCommand::Initialize(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddVectorsArgs {
    pub vectors: Vec<VectorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveVectorsArgs {
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenArgs {
    pub name: String,
}

fn default_partitions() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArgs {
    pub dimensions: usize,
    /// Home region; the deployment region when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub space: DistanceSpace,
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<String>,
    /// Warm-instance targets; the server defaults when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingTargetConfiguration>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_wire_format() {
        let req: OrchestratorRequest = serde_json::from_str(
            r#"{"databaseName":"docs","secretToken":"t","method":"query",
                "args":{"vector":[1.0,2.0],"k":3}}"#,
        )
        .unwrap();
        assert_eq!(req.database_name, "docs");
        assert_eq!(req.secret_token.as_deref(), Some("t"));
        match req.command {
            OrchestratorCommand::Query(q) => assert_eq!(q.k, 3),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unit_commands_without_args() {
        let req: OrchestratorRequest =
            serde_json::from_str(r#"{"databaseName":"docs","method":"ping"}"#).unwrap();
        assert!(matches!(req.command, OrchestratorCommand::Ping));
        assert!(req.secret_token.is_none());
        assert!(req.command.is_public());

        let req: OrchestratorRequest =
            serde_json::from_str(r#"{"databaseName":"docs","method":"wakeUpWorkers"}"#).unwrap();
        assert_eq!(req.command.method(), "wakeUpWorkers");
        assert!(!req.command.is_public());
    }

    #[test]
    fn test_initialize_defaults() {
        let req: OrchestratorRequest = serde_json::from_str(
            r#"{"databaseName":"docs","method":"initialize","args":{"dimensions":4}}"#,
        )
        .unwrap();
        let OrchestratorCommand::Initialize(args) = req.command else {
            panic!("expected initialize");
        };
        assert_eq!(args.dimensions, 4);
        assert_eq!(args.partitions, 1);
        assert_eq!(args.space, DistanceSpace::L2);
        assert!(args.region.is_none());
        assert!(args.scaling.is_none());
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let err = serde_json::from_str::<OrchestratorRequest>(
            r#"{"databaseName":"docs","method":"dropEverything"}"#,
        );
        assert!(err.is_err());
    }
}
