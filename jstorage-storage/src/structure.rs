//! Structural match against a table's `defaultStructure` template
//! (spec.md §4.3).

use serde_json::Value;

/// `candidate` matches `template` iff every key in `template` is present in
/// `candidate` with a structurally compatible value. Extra keys in
/// `candidate` are allowed; missing keys are rejected.
pub fn matches_structure(template: &Value, candidate: &Value) -> bool {
    match (template, candidate) {
        (Value::Object(template_map), Value::Object(candidate_map)) => {
            template_map.iter().all(|(key, template_value)| {
                candidate_map
                    .get(key)
                    .is_some_and(|candidate_value| matches_structure(template_value, candidate_value))
            })
        }
        (Value::Array(template_arr), Value::Array(candidate_arr)) => {
            let Some(exemplar) = template_arr.first() else {
                return true;
            };
            candidate_arr.iter().all(|elem| matches_structure(exemplar, elem))
        }
        (Value::String(_), Value::String(_)) => true,
        (Value::Number(_), Value::Number(_)) => true,
        (Value::Bool(_), Value::Bool(_)) => true,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extra_keys_are_allowed() {
        let template = json!({"title": "exemplar"});
        let candidate = json!({"title": "hello", "extra": 1});
        assert!(matches_structure(&template, &candidate));
    }

    #[test]
    fn missing_keys_are_rejected() {
        let template = json!({"title": "exemplar", "body": "exemplar"});
        let candidate = json!({"title": "hello"});
        assert!(!matches_structure(&template, &candidate));
    }

    #[test]
    fn scalar_type_mismatch_is_rejected() {
        let template = json!({"count": 1});
        let candidate = json!({"count": "not a number"});
        assert!(!matches_structure(&template, &candidate));
    }

    #[test]
    fn nested_objects_recurse() {
        let template = json!({"author": {"name": "exemplar"}});
        let candidate = json!({"author": {"name": "x", "email": "y"}});
        assert!(matches_structure(&template, &candidate));

        let bad = json!({"author": {"email": "y"}});
        assert!(!matches_structure(&template, &bad));
    }

    #[test]
    fn array_exemplar_checks_every_element_against_the_first() {
        let template = json!({"tags": ["exemplar"]});
        assert!(matches_structure(&template, &json!({"tags": ["a", "b", "c"]})));
        assert!(!matches_structure(&template, &json!({"tags": ["a", 2]})));
    }

    #[test]
    fn empty_template_array_accepts_anything() {
        let template = json!({"tags": []});
        assert!(matches_structure(&template, &json!({"tags": [1, "two", {}]})));
    }
}
