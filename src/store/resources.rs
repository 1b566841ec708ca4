use super::StoreError;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Table exposed through the generic admin CRUD routes.
#[derive(Debug)]
pub struct Resource {
    pub path: &'static str,
    pub table: &'static str,
    /// Columns a client may set on create/update. Everything else is ignored.
    pub writable: &'static [&'static str],
    /// Integer columns usable as `?column=value` list filters.
    pub filters: &'static [&'static str],
    pub soft_delete: bool,
    pub creatable: bool,
    pub deletable: bool,
}

const MCQS: Resource = Resource {
    path: "mcqs",
    table: "mcqs",
    writable: &[
        "chapter_id",
        "question",
        "options",
        "correct_answer",
        "explanation",
        "difficulty",
        "is_active",
        "is_approved",
    ],
    filters: &["chapter_id"],
    soft_delete: true,
    creatable: true,
    deletable: true,
};

pub const RESOURCES: &[Resource] = &[
    Resource {
        path: "states",
        table: "states",
        writable: &["name", "code", "is_active"],
        filters: &[],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "boards",
        table: "boards",
        writable: &["name", "state_id", "is_active", "is_approved"],
        filters: &["state_id"],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "classes",
        table: "classes",
        writable: &["name", "display_order", "is_active"],
        filters: &[],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "streams",
        table: "streams",
        writable: &["name", "is_active"],
        filters: &[],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "universities",
        table: "universities",
        writable: &["name", "state_id", "is_active", "is_approved"],
        filters: &["state_id"],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "papers",
        table: "papers",
        writable: &["name", "university_id", "is_active", "is_approved"],
        filters: &["university_id"],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "subjects",
        table: "subjects",
        writable: &[
            "name",
            "board_id",
            "class_id",
            "stream_id",
            "is_active",
            "is_approved",
        ],
        filters: &["board_id", "class_id", "stream_id"],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "chapters",
        table: "chapters",
        writable: &["name", "subject_id", "chapter_order", "is_active"],
        filters: &["subject_id"],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    MCQS,
    Resource {
        path: "subscription-plans",
        table: "subscription_plans",
        writable: &[
            "name",
            "description",
            "price_paise",
            "duration_days",
            "features",
            "is_active",
        ],
        filters: &[],
        soft_delete: true,
        creatable: true,
        deletable: true,
    },
    Resource {
        path: "payments",
        table: "payments",
        writable: &["status", "notes"],
        filters: &["user_id", "plan_id"],
        soft_delete: false,
        creatable: false,
        deletable: false,
    },
    Resource {
        path: "referrals",
        table: "referrals",
        writable: &[
            "referrer_user_id",
            "referred_user_id",
            "code",
            "reward_paise",
            "status",
        ],
        filters: &["referrer_user_id"],
        soft_delete: false,
        creatable: true,
        deletable: true,
    },
];

pub fn resource(path: &str) -> Option<&'static Resource> {
    RESOURCES.iter().find(|r| r.path == path)
}

pub fn mcqs() -> &'static Resource {
    &MCQS
}

impl Resource {
    /// Keeps only writable columns. Fails when nothing writable remains.
    pub fn sanitize(&self, payload: &Value) -> Result<Map<String, Value>, StoreError> {
        let Some(object) = payload.as_object() else {
            return Err(StoreError::InvalidPayload("expected a JSON object".into()));
        };
        let cleaned: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| self.writable.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if cleaned.is_empty() {
            return Err(StoreError::InvalidPayload(format!(
                "no writable columns for {}; expected one of {:?}",
                self.path, self.writable
            )));
        }
        Ok(cleaned)
    }

    pub fn parse_filters(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<Vec<(&'static str, i64)>, StoreError> {
        let mut filters = Vec::new();
        for column in self.filters {
            if let Some(raw) = query.get(*column) {
                let value = raw.trim().parse::<i64>().map_err(|_| {
                    StoreError::InvalidPayload(format!("filter `{column}` must be an integer"))
                })?;
                filters.push((*column, value));
            }
        }
        Ok(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_drops_unknown_columns() {
        let boards = resource("boards").expect("boards resource");
        let cleaned = boards
            .sanitize(&json!({"name": "CBSE", "id": 99, "created_at": "now"}))
            .expect("sanitize");
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned["name"], json!("CBSE"));
    }

    #[test]
    fn sanitize_rejects_payload_without_writable_columns() {
        let boards = resource("boards").expect("boards resource");
        assert!(boards.sanitize(&json!({"id": 1})).is_err());
        assert!(boards.sanitize(&json!(["name"])).is_err());
    }

    #[test]
    fn filters_only_accept_declared_integer_columns() {
        let subjects = resource("subjects").expect("subjects resource");
        let mut query = HashMap::new();
        query.insert("board_id".to_string(), "4".to_string());
        query.insert("name".to_string(), "Physics".to_string());
        assert_eq!(
            subjects.parse_filters(&query).expect("filters"),
            vec![("board_id", 4)]
        );

        query.insert("class_id".to_string(), "ten".to_string());
        assert!(subjects.parse_filters(&query).is_err());
    }

    #[test]
    fn mcq_resource_is_registered() {
        assert_eq!(mcqs().path, "mcqs");
        assert!(resource("subscription-plans").is_some());
        assert!(resource("users").is_none());
    }
}
