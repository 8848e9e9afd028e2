use serde::{Deserialize, Serialize};

use crate::core::{deadline::Deadline, domain::RunUpdate};

/// Host -> context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    Warmup,
    Run {
        code: String,
        /// Travels only in process; the JSON form is `{"type":"run","code":...}`.
        #[serde(skip)]
        deadline: Option<Deadline>,
    },
}

/// Context -> host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Ready,
    InitError { message: String },
    Stdout { data: String },
    Stderr { data: String },
    Error { message: String },
    Done,
}

impl From<WorkerMessage> for RunUpdate {
    fn from(msg: WorkerMessage) -> Self {
        match msg {
            WorkerMessage::Ready => RunUpdate::Ready,
            WorkerMessage::InitError { message } | WorkerMessage::Error { message } => {
                RunUpdate::Error { message }
            }
            WorkerMessage::Stdout { data } => RunUpdate::Stdout { data },
            WorkerMessage::Stderr { data } => RunUpdate::Stderr { data },
            WorkerMessage::Done => RunUpdate::Done,
        }
    }
}
