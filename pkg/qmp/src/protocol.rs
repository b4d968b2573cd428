use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent to the hypervisor.
#[derive(Debug, Serialize)]
pub struct Command<'a> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<&'a Value>,
    pub id: u64,
}

/// Server greeting (`{"QMP": {...}}`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Greeting {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

impl Greeting {
    /// Parse the first line sent by the server.
    pub fn from_line(line: &str) -> Option<Self> {
        let v: Value = serde_json::from_str(line).ok()?;
        let body = v.get("QMP")?.clone();
        serde_json::from_value(body).ok()
    }

    /// `major.minor.micro` of the hypervisor, when reported.
    pub fn qemu_version(&self) -> Option<String> {
        let q = self.version.get("qemu")?;
        Some(format!(
            "{}.{}.{}",
            q.get("major")?.as_u64()?,
            q.get("minor")?.as_u64()?,
            q.get("micro")?.as_u64()?
        ))
    }
}

/// One decoded server line.
#[derive(Debug)]
pub enum Reply {
    Return { id: Option<u64>, value: Value },
    Error { id: Option<u64>, class: String, desc: String },
    Event(Value),
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self, String> {
        let v: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
        let obj = v
            .as_object()
            .ok_or_else(|| "reply is not a JSON object".to_string())?;
        let id = obj.get("id").and_then(Value::as_u64);

        if obj.contains_key("event") {
            return Ok(Reply::Event(v));
        }
        if let Some(ret) = obj.get("return") {
            return Ok(Reply::Return {
                id,
                value: ret.clone(),
            });
        }
        if let Some(err) = obj.get("error") {
            let class = err
                .get("class")
                .and_then(Value::as_str)
                .unwrap_or("GenericError")
                .to_string();
            let desc = err
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(Reply::Error { id, class, desc });
        }
        Err(format!("unrecognized reply: {}", line.trim()))
    }
}

/// `query-status` result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmRunState {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}
