// This file describes how base manifests and environment merge files combine.
//
// Merge files are parsed twice: once in the typed dialect (scalars resolve to
// native booleans/numbers/strings) and once in the literal dialect (scalars
// keep their source text). The literal parse drives the control flow so `~`
// and the empty string work as sentinels, while replacement values come from
// the typed parse.

use serde_yaml::{Mapping, Value};
use yaml_rust::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust::scanner::{Marker, TScalarStyle};

use super::{ErrorKind, Result};

/// A YAML node in the literal dialect
#[derive(Clone, Debug, PartialEq)]
pub enum Raw {
    /// An empty document
    Null,
    Scalar(String),
    Sequence(Vec<Raw>),
    Mapping(Vec<(String, Raw)>),
}

struct RawLoader<'a> {
    chars: &'a [char],
    docs: Vec<Raw>,
    stack: Vec<Raw>,
    keys: Vec<Option<String>>,
    bad: Option<String>,
}

impl<'a> RawLoader<'a> {
    fn insert(&mut self, node: Raw) {
        match self.stack.last_mut() {
            None => self.docs.push(node),
            Some(Raw::Sequence(seq)) => seq.push(node),
            Some(Raw::Mapping(map)) => {
                let pending = self.keys.last_mut().unwrap();
                match pending.take() {
                    None => match node {
                        Raw::Scalar(s) => *pending = Some(s),
                        _ => self.bad = Some("a complex mapping key".into()),
                    },
                    Some(k) => map.push((k, node)),
                }
            }
            _ => unreachable!("scalars never land on the container stack"),
        }
    }

    // The parser reports a missing node as a plain `~` scalar. A real tilde
    // has the character present at the event position, followed by a break.
    fn tilde_in_source(&self, mark: Marker) -> bool {
        if self.chars.get(mark.index()) != Some(&'~') {
            return false;
        }
        match self.chars.get(mark.index() + 1) {
            None => true,
            Some(c) => c.is_whitespace() || matches!(c, ',' | ']' | '}' | '#'),
        }
    }
}

impl<'a> MarkedEventReceiver for RawLoader<'a> {
    fn on_event(&mut self, ev: Event, mark: Marker) {
        match ev {
            Event::Scalar(value, style, _, _) => {
                let node = if value == "~"
                    && style == TScalarStyle::Plain
                    && !self.tilde_in_source(mark)
                {
                    Raw::Scalar(String::new())
                } else {
                    Raw::Scalar(value)
                };
                self.insert(node);
            }
            Event::SequenceStart(_) => self.stack.push(Raw::Sequence(vec![])),
            Event::MappingStart(_) => {
                self.stack.push(Raw::Mapping(vec![]));
                self.keys.push(None);
            }
            Event::SequenceEnd => {
                let node = self.stack.pop().unwrap();
                self.insert(node);
            }
            Event::MappingEnd => {
                self.keys.pop();
                let node = self.stack.pop().unwrap();
                self.insert(node);
            }
            Event::Alias(_) => self.bad = Some("an alias".into()),
            _ => {}
        }
    }
}

fn is_blank(doc: &str) -> bool {
    doc.lines().all(|l| {
        let t = l.trim();
        t.is_empty() || t.starts_with('#')
    })
}

// Split a stream into documents; an all-blank segment before the first `---`
// is not a document.
fn split_documents(data: &str) -> Vec<String> {
    let mut docs = vec![];
    let mut cur = String::new();
    let mut seen_sep = false;
    for line in data.lines() {
        let t = line.trim_end();
        if t == "---" || t.starts_with("--- ") {
            if seen_sep || !is_blank(&cur) {
                docs.push(cur.clone());
            }
            cur.clear();
            seen_sep = true;
            if let Some(rest) = t.strip_prefix("--- ") {
                cur.push_str(rest);
                cur.push('\n');
            }
        } else {
            cur.push_str(line);
            cur.push('\n');
        }
    }
    if seen_sep || !is_blank(&cur) {
        docs.push(cur);
    }
    docs
}

fn parse_raw_doc(src: &str) -> Result<Raw> {
    if is_blank(src) {
        return Ok(Raw::Null);
    }
    let chars: Vec<char> = src.chars().collect();
    let mut loader = RawLoader {
        chars: &chars,
        docs: vec![],
        stack: vec![],
        keys: vec![],
        bad: None,
    };
    let mut parser = Parser::new(src.chars());
    parser.load(&mut loader, false)?;
    if let Some(what) = loader.bad {
        bail!(ErrorKind::UnsupportedMerge(what));
    }
    Ok(loader.docs.pop().unwrap_or(Raw::Null))
}

/// Load a YAML stream in the typed dialect
pub fn load_all(data: &str) -> Result<Vec<Value>> {
    split_documents(data)
        .iter()
        .map(|d| {
            if is_blank(d) {
                Ok(Value::Null)
            } else {
                Ok(serde_yaml::from_str(d)?)
            }
        })
        .collect()
}

/// Load a YAML stream in the literal dialect
pub fn load_all_raw(data: &str) -> Result<Vec<Raw>> {
    split_documents(data).iter().map(|d| parse_raw_doc(d)).collect()
}

/// Serialize a document stream in stable block style
pub fn dump_all(docs: &[Value]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        out.push_str(&serde_yaml::to_string(doc)?);
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

/// Merge override documents into source documents, position by position
///
/// `overrides` and `base_overrides` are the same stream parsed in the typed
/// and literal dialects. Empty override documents leave the source unchanged,
/// as does an override stream shorter than the source.
pub fn merge_docs(src: Vec<Value>, overrides: &[Value], base_overrides: &[Raw]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(src.len());
    for (i, doc) in src.into_iter().enumerate() {
        let merged = match (overrides.get(i), base_overrides.get(i)) {
            (Some(typed), Some(base)) if *base != Raw::Null => {
                merge_node(&doc, typed, base, &format!("doc[{}]", i))?
            }
            _ => doc,
        };
        out.push(merged);
    }
    Ok(out)
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Bool(_) | Value::Number(_))
}

fn node_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
    }
}

// Fresh container for an override key the source doesn't have yet.
fn empty_like(typed: &Value, base: &Raw) -> Value {
    match (typed, base) {
        (Value::Sequence(_), _) | (Value::Null, Raw::Sequence(_)) => Value::Sequence(vec![]),
        _ => Value::Mapping(Mapping::new()),
    }
}

fn merge_node(src: &Value, typed: &Value, base: &Raw, path: &str) -> Result<Value> {
    match src {
        Value::Mapping(map) => merge_mapping(map, typed, base, path),
        Value::Sequence(seq) => merge_sequence(seq, typed, base, path),
        other => bail!(ErrorKind::UnsupportedMerge(format!(
            "{} ({})",
            path,
            node_kind(other)
        ))),
    }
}

fn merge_mapping(src: &Mapping, typed: &Value, base: &Raw, path: &str) -> Result<Value> {
    let base_map = match base {
        Raw::Mapping(m) => m,
        _ => bail!(ErrorKind::UnsupportedMerge(path.to_string())),
    };
    let empty = Mapping::new();
    let typed_map = typed.as_mapping().unwrap_or(&empty);

    let mut rest = src.clone();
    let mut res = Mapping::new();
    for (key, bval) in base_map {
        let vkey = Value::String(key.clone());
        if let Raw::Scalar(s) = bval {
            if s == "~" {
                // deletion sentinel
                rest.remove(&vkey);
                continue;
            }
            if s.is_empty() {
                // keep sentinel
                if let Some(v) = rest.remove(&vkey) {
                    res.insert(vkey, v);
                }
                continue;
            }
        }
        let next_path = format!("{}.{}", path, key);
        let tval = typed_map.get(&vkey).cloned().unwrap_or(Value::Null);
        if is_scalar(&tval) {
            rest.remove(&vkey);
            res.insert(vkey, tval);
        } else if let Some(sval) = rest.remove(&vkey) {
            res.insert(vkey, merge_node(&sval, &tval, bval, &next_path)?);
        } else {
            let fresh = empty_like(&tval, bval);
            res.insert(vkey, merge_node(&fresh, &tval, bval, &next_path)?);
        }
    }
    // untouched source keys carry over in their original order
    for (k, v) in rest {
        res.insert(k, v);
    }
    Ok(Value::Mapping(res))
}

fn merge_sequence(src: &[Value], typed: &Value, base: &Raw, path: &str) -> Result<Value> {
    let base_seq = match base {
        Raw::Sequence(s) => s,
        _ => bail!(ErrorKind::UnsupportedMerge(path.to_string())),
    };
    let empty = vec![];
    let typed_seq = typed.as_sequence().unwrap_or(&empty);

    let mut res = vec![];
    for (idx, bval) in base_seq.iter().enumerate() {
        let next_path = format!("{}[{}]", path, idx);
        let tval = typed_seq.get(idx).cloned().unwrap_or(Value::Null);
        if idx >= src.len() {
            // entries past the end of the source are appended
            if matches!(bval, Raw::Mapping(_) | Raw::Sequence(_)) {
                let fresh = empty_like(&tval, bval);
                res.push(merge_node(&fresh, &tval, bval, &next_path)?);
            } else {
                res.push(tval);
            }
            continue;
        }
        if let Raw::Scalar(s) = bval {
            if s == "~" {
                // deletion sentinel drops this position
                continue;
            }
            if s.is_empty() {
                res.push(src[idx].clone());
                continue;
            }
        }
        if is_scalar(&tval) {
            res.push(tval);
        } else {
            res.push(merge_node(&src[idx], &tval, bval, &next_path)?);
        }
    }
    if src.len() > base_seq.len() {
        res.extend_from_slice(&src[base_seq.len()..]);
    }
    Ok(Value::Sequence(res))
}

#[cfg(test)]
mod tests {
    use super::{load_all, load_all_raw, merge_docs, Raw};
    use serde_yaml::Value;

    const MERGE_SRC: &str = "
apiVersion: v1
kind: ConfigMap
metadata:
  name: myproj-constants
data:
  UNCHANGED_SETTING: \"value\"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: myproj-settings
data:
  MY_SETTING: \"foo\"
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: big-deployment
spec:
  replicas: 2
  selector:
    matchLabels:
      app: big-deployment
  template:
    metadata:
      labels:
        app: big-deployment
    spec:
      containers:
        - name: first-container
          imagePullPolicy: IfNotPresent
          image: first-container:latest
        - name: second-container
          imagePullPolicy: IfNotPresent
          image: second-container:latest
      volumes:
        - name: some-data
          persistentVolumeClaim:
            claimName: some-data
";

    const MERGE_CHANGES: &str = "
---
---
data:
  MY_SETTING: \"bar\"
---
spec:
  template:
    spec:
      containers:
        -
        - volumeMounts:
            - mountPath: /var/run/docker.sock
              name: docker-volume
      volumes:
        - persistentVolumeClaim: ~
        - name: docker-volume
          hostPath:
            path: /var/run/docker.sock
";

    const MERGE_EXPECTED: &str = "
apiVersion: v1
kind: ConfigMap
metadata:
  name: myproj-constants
data:
  UNCHANGED_SETTING: \"value\"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: myproj-settings
data:
  MY_SETTING: \"bar\"
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: big-deployment
spec:
  replicas: 2
  selector:
    matchLabels:
      app: big-deployment
  template:
    metadata:
      labels:
        app: big-deployment
    spec:
      containers:
        - name: first-container
          imagePullPolicy: IfNotPresent
          image: first-container:latest
        - name: second-container
          imagePullPolicy: IfNotPresent
          image: second-container:latest
          volumeMounts:
            - mountPath: /var/run/docker.sock
              name: docker-volume
      volumes:
        - name: some-data
        - name: docker-volume
          hostPath:
            path: /var/run/docker.sock
";

    // order insensitive comparison form, the merge reorders overridden keys
    fn canon(docs: &[Value]) -> Vec<serde_json::Value> {
        docs.iter()
            .map(|d| serde_json::to_value(d).unwrap())
            .collect()
    }

    fn apply(src: &str, changes: &str) -> Vec<Value> {
        let docs = load_all(src).unwrap();
        let overrides = load_all(changes).unwrap();
        let raw = load_all_raw(changes).unwrap();
        merge_docs(docs, &overrides, &raw).unwrap()
    }

    #[test]
    fn literal_dialect_keeps_source_text() {
        let raw = load_all_raw("a: ~\nb:\nc: \"\"\nd: True\ne: 3\n").unwrap();
        match &raw[0] {
            Raw::Mapping(m) => {
                assert_eq!(m[0], ("a".into(), Raw::Scalar("~".into())));
                assert_eq!(m[1], ("b".into(), Raw::Scalar("".into())));
                assert_eq!(m[2], ("c".into(), Raw::Scalar("".into())));
                assert_eq!(m[3], ("d".into(), Raw::Scalar("True".into())));
                assert_eq!(m[4], ("e".into(), Raw::Scalar("3".into())));
            }
            other => panic!("expected mapping, got {:?}", other),
        }
    }

    #[test]
    fn literal_dialect_empty_sequence_entries() {
        let raw = load_all_raw("xs:\n  -\n  - ~\n  - kept\n").unwrap();
        match &raw[0] {
            Raw::Mapping(m) => {
                assert_eq!(
                    m[0].1,
                    Raw::Sequence(vec![
                        Raw::Scalar("".into()),
                        Raw::Scalar("~".into()),
                        Raw::Scalar("kept".into()),
                    ])
                );
            }
            other => panic!("expected mapping, got {:?}", other),
        }
    }

    #[test]
    fn merge_kube_configs() {
        let merged = apply(MERGE_SRC, MERGE_CHANGES);
        let expected = load_all(MERGE_EXPECTED).unwrap();
        assert_eq!(canon(&merged), canon(&expected));
    }

    #[test]
    fn merge_is_idempotent() {
        let once = apply(MERGE_SRC, MERGE_CHANGES);
        let overrides = load_all(MERGE_CHANGES).unwrap();
        let raw = load_all_raw(MERGE_CHANGES).unwrap();
        let twice = merge_docs(once.clone(), &overrides, &raw).unwrap();
        assert_eq!(canon(&once), canon(&twice));
    }

    #[test]
    fn empty_override_documents_are_identity() {
        let src = load_all(MERGE_SRC).unwrap();
        let merged = apply(MERGE_SRC, "---\n---\n---\n");
        assert_eq!(canon(&src), canon(&merged));
    }

    #[test]
    fn keep_sentinel_is_identity() {
        let merged = apply(
            "spec:\n  replicas: 2\n  paused: false\n",
            "spec:\n  replicas: \"\"\n  paused: \"\"\n",
        );
        let expected = load_all("spec:\n  replicas: 2\n  paused: false\n").unwrap();
        assert_eq!(canon(&merged), canon(&expected));
    }

    #[test]
    fn deletion_sentinel_removes_keys() {
        let merged = apply("a: 1\nb: 2\n", "a: ~\n");
        let expected = load_all("b: 2\n").unwrap();
        assert_eq!(canon(&merged), canon(&expected));
    }

    #[test]
    fn typed_values_win_over_literal_text() {
        let merged = apply("replicas: 2\nflag: false\n", "replicas: 3\nflag: true\n");
        assert_eq!(merged[0].get("replicas"), Some(&Value::Number(3.into())));
        assert_eq!(merged[0].get("flag"), Some(&Value::Bool(true)));
    }

    #[test]
    fn added_keys_nest_into_fresh_containers() {
        let merged = apply(
            "spec: {}\n",
            "spec:\n  probe:\n    command:\n      - cat\n      - /tmp/healthy\n    delay: 5\n",
        );
        let expected = load_all(
            "spec:\n  probe:\n    command:\n      - cat\n      - /tmp/healthy\n    delay: 5\n",
        )
        .unwrap();
        assert_eq!(canon(&merged), canon(&expected));
    }

    #[test]
    fn source_tail_is_kept() {
        let merged = apply("xs:\n  - a\n  - b\n  - c\n", "xs:\n  - z\n");
        let expected = load_all("xs:\n  - z\n  - b\n  - c\n").unwrap();
        assert_eq!(canon(&merged), canon(&expected));
    }

    #[test]
    fn scalar_source_documents_are_rejected() {
        let docs = load_all("just a scalar\n").unwrap();
        let overrides = load_all("a: 1\n").unwrap();
        let raw = load_all_raw("a: 1\n").unwrap();
        assert!(merge_docs(docs, &overrides, &raw).is_err());
    }

    #[test]
    fn dump_round_trips() {
        let merged = apply(MERGE_SRC, MERGE_CHANGES);
        let dumped = super::dump_all(&merged).unwrap();
        let reloaded = load_all(&dumped).unwrap();
        assert_eq!(canon(&merged), canon(&reloaded));
    }
}
