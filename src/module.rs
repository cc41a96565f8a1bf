//! Module descriptors and the dynamic stream identifier used at binding
//! boundaries (spec §4.G, §9 "Dynamic stream identifiers"). A [`Module`]
//! is the static description of one subprocess: its command line and its
//! named input/output bindings. [`StreamRef`] is the tagged identifier
//! the reference implementation passes as `Union[Stream, str, int]`;
//! here it is resolved once, at the boundary, into a concrete match
//! against a producing [`Worker`](crate::worker::Worker)'s outputs.

use std::collections::HashMap;

use crate::stream::Stream;

/// A stream identified one of three ways: by stable id, by path (out of
/// scope for the core, but carried so call sites compile against the
/// real shape), or by an already-resolved value.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamRef {
    ById(i64),
    ByPath(String),
    ByValue(Stream),
}

impl StreamRef {
    pub fn matches(&self, stream: &Stream) -> bool {
        match self {
            StreamRef::ById(id) => *id == stream.id,
            StreamRef::ByPath(_) => false, // folder/path resolution is out of scope for the core
            StreamRef::ByValue(s) => s.id == stream.id,
        }
    }
}

/// Static description of one module subprocess: its command line and its
/// named input/output stream bindings.
#[derive(Clone, Debug)]
pub struct Module {
    pub name: String,
    pub exec_cmd: String,
    /// Named input bindings: local name -> producing stream reference.
    pub inputs: HashMap<String, StreamRef>,
    /// Named output bindings: local name -> the stream this module produces.
    pub outputs: HashMap<String, Stream>,
    pub restart: bool,
}

impl Module {
    pub fn new(name: impl Into<String>, exec_cmd: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            exec_cmd: exec_cmd.into(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            restart: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    fn stream(id: i64) -> Stream {
        Stream::new(id, "accel", Layout::parse("float32_3").unwrap())
    }

    #[test]
    fn by_id_matches_only_that_id() {
        let s = stream(7);
        assert!(StreamRef::ById(7).matches(&s));
        assert!(!StreamRef::ById(8).matches(&s));
    }

    #[test]
    fn by_value_matches_on_id_not_full_equality() {
        let s = stream(7);
        let mut other = stream(7);
        other.name = "renamed".into();
        assert!(StreamRef::ByValue(other).matches(&s));
    }

    #[test]
    fn by_path_never_matches() {
        let s = stream(7);
        assert!(!StreamRef::ByPath("/raw/accel".into()).matches(&s));
    }

    #[test]
    fn new_module_defaults_to_restart_true_and_empty_bindings() {
        let m = Module::new("filter", "/usr/bin/filter.py");
        assert_eq!(m.name, "filter");
        assert!(m.restart);
        assert!(m.inputs.is_empty());
        assert!(m.outputs.is_empty());
    }
}
