//! Feedback messages: status/result reports for an action, and their DDI JSON bodies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ddi::{
    ConfigDataBody, Execution, FeedbackBody, Finished, Progress, ResultBody, StatusBody,
};

/// Timestamp format used in DDI bodies.
pub const TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// A status report for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackMessage {
    pub action_id: String,
    pub execution: Execution,
    pub finished: Finished,
    pub details: Vec<String>,
    /// Percent complete, when the installer reports one.
    pub progress: Option<u32>,
}

impl FeedbackMessage {
    /// `proceeding` / `none`: the action is still running.
    pub fn proceeding(action_id: &str, detail: impl Into<String>) -> Self {
        Self::new(action_id, Execution::Proceeding, Finished::None, detail)
    }

    /// `closed` / `success`.
    pub fn success(action_id: &str, detail: impl Into<String>) -> Self {
        Self::new(action_id, Execution::Closed, Finished::Success, detail)
    }

    /// `closed` / `failure`.
    pub fn failure(action_id: &str, detail: impl Into<String>) -> Self {
        Self::new(action_id, Execution::Closed, Finished::Failure, detail)
    }

    /// Installer progress line. A leading `NN%` becomes the progress counter.
    pub fn install_progress(action_id: &str, line: &str) -> Self {
        let mut msg = Self::proceeding(action_id, line.trim());
        msg.progress = parse_percent(line);
        msg
    }

    fn new(
        action_id: &str,
        execution: Execution,
        finished: Finished,
        detail: impl Into<String>,
    ) -> Self {
        let detail = detail.into();
        Self {
            action_id: action_id.to_string(),
            execution,
            finished,
            details: if detail.is_empty() { vec![] } else { vec![detail] },
            progress: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.execution == Execution::Closed
    }

    /// Serialize to the DDI feedback shape, stamped with `time`.
    pub fn to_body(&self, time: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let body = FeedbackBody {
            id: self.action_id.clone(),
            time: timestamp(time),
            status: StatusBody {
                execution: self.execution,
                result: ResultBody {
                    finished: self.finished,
                    progress: self.progress.map(|cnt| Progress { cnt, of: 100 }),
                },
                details: self.details.clone(),
            },
        };
        serde_json::to_string(&body)
    }
}

/// Identification body: the device attribute map, merged into the server's record.
pub fn config_data_body(
    attributes: &BTreeMap<String, String>,
    time: DateTime<Utc>,
) -> Result<String, serde_json::Error> {
    let body = ConfigDataBody {
        id: String::new(),
        time: timestamp(time),
        status: StatusBody {
            execution: Execution::Closed,
            result: ResultBody {
                finished: Finished::Success,
                progress: None,
            },
            details: vec![],
        },
        mode: "merge",
        data: attributes.clone(),
    };
    serde_json::to_string(&body)
}

pub fn timestamp(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn parse_percent(line: &str) -> Option<u32> {
    let (num, _) = line.trim_start().split_once('%')?;
    let n: u32 = num.trim().parse().ok()?;
    (n <= 100).then_some(n)
}
