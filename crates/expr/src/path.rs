//! JSON-path parsing and traversal.
//!
//! Paths start with `$` and address nested documents with dotted keys,
//! bracketed keys and non-negative list indexes: `$.a.b`, `$["a"]['b']`,
//! `$.spec.ports[0]`. A path that dereferences a missing key resolves to
//! `null`; the consuming operator decides whether that is fatal.

use serde_json::{Map, Value};

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Key(String),
    Index(usize),
}

/// Parse a `$`-rooted path into steps. `$` and `$.` address the root
/// itself. `$Kind.path` is shorthand for `$.Kind.path`.
pub fn parse(path: &str) -> Result<Vec<Step>, Error> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| Error::path(path, "must start with $"))?;
    if rest.is_empty() || rest == "." {
        return Ok(Vec::new());
    }

    let mut steps = Vec::new();
    let chars: Vec<char> = rest.chars().collect();
    let mut i = 0;

    // leading identifier without a dot: the $Kind form
    if chars[0] != '.' && chars[0] != '[' {
        let start = i;
        while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
            i += 1;
        }
        steps.push(Step::Key(chars[start..i].iter().collect()));
    }

    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                if i == start {
                    return Err(Error::path(path, "empty key segment"));
                }
                steps.push(Step::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                i += 1;
                if i >= chars.len() {
                    return Err(Error::path(path, "unterminated bracket"));
                }
                if chars[i] == '"' || chars[i] == '\'' {
                    let quote = chars[i];
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != quote {
                        i += 1;
                    }
                    if i >= chars.len() {
                        return Err(Error::path(path, "unterminated quoted key"));
                    }
                    steps.push(Step::Key(chars[start..i].iter().collect()));
                    i += 1; // closing quote
                } else {
                    let start = i;
                    while i < chars.len() && chars[i] != ']' {
                        i += 1;
                    }
                    let digits: String = chars[start..i].iter().collect();
                    let idx = digits
                        .parse::<usize>()
                        .map_err(|_| Error::path(path, "index must be a non-negative integer"))?;
                    steps.push(Step::Index(idx));
                }
                if i >= chars.len() || chars[i] != ']' {
                    return Err(Error::path(path, "unterminated bracket"));
                }
                i += 1; // closing bracket
            }
            c => {
                return Err(Error::path(path, format!("unexpected character {c:?}")));
            }
        }
    }

    Ok(steps)
}

/// Parse a `@dict` setter key. A leading `$` makes it a full path; a plain
/// key containing dots splits on them; anything else is a literal key.
/// Dotted literal keys (annotation domains) must use the bracket form.
pub fn parse_setter(key: &str) -> Result<Vec<Step>, Error> {
    if key.starts_with('$') {
        return parse(key);
    }
    if key.contains('.') {
        let mut steps = Vec::new();
        for part in key.split('.') {
            if part.is_empty() {
                return Err(Error::path(key, "empty key segment"));
            }
            steps.push(Step::Key(part.to_string()));
        }
        return Ok(steps);
    }
    Ok(vec![Step::Key(key.to_string())])
}

/// Resolve a path against a root document. Missing keys yield `null`.
pub fn get(root: &Value, steps: &[Step]) -> Value {
    let mut cur = root;
    for step in steps {
        let next = match step {
            Step::Key(k) => cur.get(k.as_str()),
            Step::Index(i) => cur.get(*i),
        };
        match next {
            Some(v) => cur = v,
            None => return Value::Null,
        }
    }
    cur.clone()
}

/// Write `value` at `steps` under `root`, creating intermediate maps.
/// List indexes must address existing elements.
pub fn set(root: &mut Value, path: &str, steps: &[Step], value: Value) -> Result<(), Error> {
    let Some((last, intermediate)) = steps.split_last() else {
        return Err(Error::path(path, "cannot set the root"));
    };
    let mut cur = root;
    for step in intermediate {
        match step {
            Step::Key(k) => {
                if cur.is_null() {
                    *cur = Value::Object(Map::new());
                }
                let map = cur
                    .as_object_mut()
                    .ok_or_else(|| Error::path(path, "intermediate value is not a map"))?;
                cur = map.entry(k.clone()).or_insert(Value::Null);
            }
            Step::Index(i) => {
                let list = cur
                    .as_array_mut()
                    .ok_or_else(|| Error::path(path, "intermediate value is not a list"))?;
                cur = list
                    .get_mut(*i)
                    .ok_or_else(|| Error::path(path, "list index out of bounds"))?;
            }
        }
    }
    match last {
        Step::Key(k) => {
            if cur.is_null() {
                *cur = Value::Object(Map::new());
            }
            let map = cur
                .as_object_mut()
                .ok_or_else(|| Error::path(path, "target value is not a map"))?;
            map.insert(k.clone(), value);
        }
        Step::Index(i) => {
            let list = cur
                .as_array_mut()
                .ok_or_else(|| Error::path(path, "target value is not a list"))?;
            let slot = list
                .get_mut(*i)
                .ok_or_else(|| Error::path(path, "list index out of bounds"))?;
            *slot = value;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_bracketed() {
        let steps = parse("$.metadata.annotations[\"related-cm\"]").unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Key("metadata".into()),
                Step::Key("annotations".into()),
                Step::Key("related-cm".into())
            ]
        );
        assert_eq!(parse("$").unwrap(), Vec::new());
        assert_eq!(parse("$.").unwrap(), Vec::new());
        assert_eq!(
            parse("$Deployment.metadata.name").unwrap(),
            parse("$.Deployment.metadata.name").unwrap()
        );
        assert_eq!(parse("$.a[0]").unwrap(), vec![Step::Key("a".into()), Step::Index(0)]);
        assert!(parse("metadata.name").is_err());
        assert!(parse("$.a[").is_err());
        assert!(parse("$.a..b").is_err());
    }

    #[test]
    fn get_missing_is_null() {
        let doc = json!({"a": {"b": [1, 2]}});
        assert_eq!(get(&doc, &parse("$.a.b[1]").unwrap()), json!(2));
        assert_eq!(get(&doc, &parse("$.a.c").unwrap()), Value::Null);
        assert_eq!(get(&doc, &parse("$.a.b[7]").unwrap()), Value::Null);
        assert_eq!(get(&doc, &parse("$").unwrap()), doc);
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut doc = json!({});
        let steps = parse_setter("a.b.c").unwrap();
        set(&mut doc, "a.b.c", &steps, json!(7)).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": 7}}}));

        let steps = parse_setter("$.a.d").unwrap();
        set(&mut doc, "$.a.d", &steps, json!("x")).unwrap();
        assert_eq!(doc["a"]["d"], json!("x"));
        assert_eq!(doc["a"]["b"]["c"], json!(7));
    }

    #[test]
    fn setter_keys_split_on_dots_only_unbracketed() {
        assert_eq!(parse_setter("plain").unwrap(), vec![Step::Key("plain".into())]);
        assert_eq!(
            parse_setter("$[\"metadata\"][\"annotations\"][\"app.kubernetes.io/name\"]").unwrap(),
            vec![
                Step::Key("metadata".into()),
                Step::Key("annotations".into()),
                Step::Key("app.kubernetes.io/name".into())
            ]
        );
    }
}
