use serde::{Deserialize, Serialize};

use crate::ssh::SshCredentials;

/// Event delivered to a user's stream through the backend.
///
/// Serialized as a JSON object tagged by `type`, e.g.
/// `{"type":"pull_data","data":"Pulling fs layer"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    PullData {
        data: String,
    },
    PullSuccess,
    PullError {
        message: String,
    },
    PushData {
        data: String,
    },
    PushSuccess,
    PushError {
        message: String,
    },
    ExecError {
        job_id: u64,
        message: String,
        exit_code: Option<i32>,
    },
    /// A batch command exited cleanly, or an interactive container is
    /// reachable through `connection`.
    ExecSuccess {
        job_id: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection: Option<SshCredentials>,
    },
    StartError {
        job_id: u64,
        message: String,
    },
    CommitError {
        message: String,
    },
    RegisterSuccess {
        image: String,
    },
    RegisterError {
        message: String,
    },
}

impl UserEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            UserEvent::PullData { .. } => "pull_data",
            UserEvent::PullSuccess => "pull_success",
            UserEvent::PullError { .. } => "pull_error",
            UserEvent::PushData { .. } => "push_data",
            UserEvent::PushSuccess => "push_success",
            UserEvent::PushError { .. } => "push_error",
            UserEvent::ExecError { .. } => "exec_error",
            UserEvent::ExecSuccess { .. } => "exec_success",
            UserEvent::StartError { .. } => "start_error",
            UserEvent::CommitError { .. } => "commit_error",
            UserEvent::RegisterSuccess { .. } => "register_success",
            UserEvent::RegisterError { .. } => "register_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_by_kind() {
        let event = UserEvent::PullData {
            data: "Downloading".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "pull_data", "data": "Downloading" })
        );
        assert_eq!(
            serde_json::to_value(UserEvent::PushSuccess).unwrap(),
            json!({ "type": "push_success" })
        );
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let events = [
            UserEvent::PullSuccess,
            UserEvent::CommitError {
                message: "boom".to_string(),
            },
            UserEvent::ExecError {
                job_id: 3,
                message: "exit 2".to_string(),
                exit_code: Some(2),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn exec_success_carries_credentials() {
        let event = UserEvent::ExecSuccess {
            job_id: 9,
            message: "ready".to_string(),
            connection: Some(SshCredentials {
                host: "rpi-01".to_string(),
                port: 2201,
                username: "uabc".to_string(),
                password: "secret".to_string(),
            }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["connection"]["port"], 2201);

        let back: UserEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
