use serde::{ Serialize, Deserialize };

/// Who spoke a turn. Stored and streamed as `"user"` / `"AI"`; any other stored
/// value is kept verbatim as `Other` so a bad record never fails a whole session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Other(String),
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "user" => Role::User,
            "AI" => Role::Assistant,
            _ => Role::Other(value),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::User => "user".to_string(),
            Role::Assistant => "AI".to_string(),
            Role::Other(value) => value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One streamed unit of output. `text` is the whole answer so far plus the
/// static knowledge footer, never a delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFragment {
    pub role: Role,
    pub id: String,
    pub parent_message_id: Option<String>,
    pub text: String,
}

/// `{message, status, data}` envelope shared by `/config` and the error sentinels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub message: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    pub data: serde_json::Value,
}

impl ApiEnvelope {
    pub fn success() -> Self {
        Self {
            message: None,
            status: "Success".to_string(),
            code: None,
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            status: "Fail".to_string(),
            code: Some(code.to_string()),
            data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_use_stored_spelling() {
        let turn: Turn = serde_json::from_str(r#"{"role":"AI","content":"hi"}"#).unwrap();
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(serde_json::to_string(&Turn::user("q")).unwrap(), r#"{"role":"user","content":"q"}"#);
    }

    #[test]
    fn unknown_roles_survive_deserialization() {
        let turns: Vec<Turn> = serde_json
            ::from_str(r#"[{"role":"system","content":"x"},{"role":"user","content":"y"}]"#)
            .unwrap();
        assert_eq!(turns[0].role, Role::Other("system".into()));
        assert_eq!(String::from(turns[0].role.clone()), "system");
    }

    #[test]
    fn fragment_serializes_with_parent_message_id() {
        let fragment = AnswerFragment {
            role: Role::Assistant,
            id: "chatglmabc".into(),
            parent_message_id: None,
            text: "hel".into(),
        };
        let value = serde_json::to_value(&fragment).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"role": "AI", "id": "chatglmabc", "parentMessageId": null, "text": "hel"})
        );
    }

    #[test]
    fn success_envelope_matches_handshake_shape() {
        let value = serde_json::to_value(ApiEnvelope::success()).unwrap();
        assert_eq!(value, serde_json::json!({"message": null, "status": "Success", "data": {}}));
    }
}
