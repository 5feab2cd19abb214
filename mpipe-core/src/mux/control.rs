use std::convert::Infallible;
use std::str::FromStr;

/// Control query sent to a muxer
///
/// The named variants are the closed set every format answers. Anything
/// else parses to [`MuxQuery::Named`] and is answered with `Unsupported`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxQuery {
    /// "can-add-stream-while-muxing"
    CanAddStreamWhileMuxing,
    /// "get-add-stream-wait"
    AddStreamWait,
    /// "get-mime"
    Mime,
    Named(String),
}

impl MuxQuery {
    pub fn as_str(&self) -> &str {
        match self {
            MuxQuery::CanAddStreamWhileMuxing => "can-add-stream-while-muxing",
            MuxQuery::AddStreamWait => "get-add-stream-wait",
            MuxQuery::Mime => "get-mime",
            MuxQuery::Named(name) => name,
        }
    }
}

impl FromStr for MuxQuery {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "can-add-stream-while-muxing" => MuxQuery::CanAddStreamWhileMuxing,
            "get-add-stream-wait" => MuxQuery::AddStreamWait,
            "get-mime" => MuxQuery::Mime,
            other => MuxQuery::Named(other.to_string()),
        })
    }
}

impl std::fmt::Display for MuxQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a [`MuxQuery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxReply {
    Bool(bool),
    Mime(String),
}

impl MuxReply {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MuxReply::Bool(value) => Some(*value),
            MuxReply::Mime(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MuxReply::Mime(mime) => Some(mime),
            MuxReply::Bool(_) => None,
        }
    }
}
