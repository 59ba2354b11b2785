//! Plaintext command request for single-shot dispatch.
//!
//! The remote agent owns this schema. The dispatch path only encrypts the
//! serialized string; the types here exist so the CLI does not hand-assemble JSON.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_params: RequestParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    pub request_type: String,
    pub command_params: CommandParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParams {
    pub command_type: String,
    pub run_mode: RunMode,
    pub command_data: CommandData,
    pub command_progress_info_params: ProgressInfoParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Async,
    Sync,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_bash_script_data: Option<RunBashScriptData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBashScriptData {
    /// Script body, base64 of its UTF-8 bytes.
    pub script_data: String,
    pub script_data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressInfoParams {
    pub stream_progress_type: String,
}

impl Default for ProgressInfoParams {
    fn default() -> Self {
        Self {
            stream_progress_type: "realtime".to_string(),
        }
    }
}

pub const REQUEST_TYPE_COMMAND_EXECUTION: &str = "command_execution";
pub const COMMAND_RUN_BASH_SCRIPT: &str = "run_bash_script";
pub const SCRIPT_DATA_TYPE_B64_UTF8: &str = "bash_script_b64_utf8";

impl CommandRequest {
    /// Asynchronous `run_bash_script` with realtime progress.
    pub fn run_bash_script(script: &str) -> Self {
        Self {
            request_params: RequestParams {
                request_type: REQUEST_TYPE_COMMAND_EXECUTION.to_string(),
                command_params: CommandParams {
                    command_type: COMMAND_RUN_BASH_SCRIPT.to_string(),
                    run_mode: RunMode::Async,
                    command_data: CommandData {
                        run_bash_script_data: Some(RunBashScriptData {
                            script_data: BASE64_STANDARD.encode(script.as_bytes()),
                            script_data_type: SCRIPT_DATA_TYPE_B64_UTF8.to_string(),
                        }),
                    },
                    command_progress_info_params: ProgressInfoParams::default(),
                },
            },
        }
    }

    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.request_params.command_params.run_mode = mode;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_world_request_matches_agent_schema() {
        let request = CommandRequest::run_bash_script("echo 'Hello, World!'\n");
        let expected = concat!(
            r#"{"request_params":{"request_type":"command_execution","#,
            r#""command_params":{"command_type":"run_bash_script","run_mode":"async","#,
            r#""command_data":{"run_bash_script_data":{"script_data":"ZWNobyAnSGVsbG8sIFdvcmxkIScK","#,
            r#""script_data_type":"bash_script_b64_utf8"}},"#,
            r#""command_progress_info_params":{"stream_progress_type":"realtime"}}}}"#,
        );
        assert_eq!(request.to_json().unwrap(), expected);
    }

    #[test]
    fn test_sync_run_mode() {
        let request = CommandRequest::run_bash_script("true").with_run_mode(RunMode::Sync);
        let json: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(json["request_params"]["command_params"]["run_mode"], "sync");
    }

    #[test]
    fn test_parses_back() {
        let request = CommandRequest::run_bash_script("ls -la");
        let parsed: CommandRequest = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        let data = parsed
            .request_params
            .command_params
            .command_data
            .run_bash_script_data
            .unwrap();
        assert_eq!(BASE64_STANDARD.decode(data.script_data).unwrap(), b"ls -la");
    }
}
