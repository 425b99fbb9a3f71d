//! Build argument resolution and substitution.
//!
//! Declarations are recorded per scope (global, before the first `FROM`, or a
//! stage ordinal) together with their position in the instruction sequence.
//! A lookup at a given position sees the nearest preceding declaration in the
//! current stage, falling back to the nearest preceding global one.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::parser::{Instruction, InstructionKind, is_valid_arg_name};
use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgOrigin {
    Default,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArg {
    pub key: String,
    pub value: String,
    pub origin: ArgOrigin,
}

/// Which declarations a lookup can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only arguments declared before the first `FROM`
    Global,
    /// A stage's own arguments, then the global ones
    Stage(usize),
}

#[derive(Debug, Clone)]
struct Declaration {
    position: usize,
    key: String,
    /// `None` when declared without a default and not overridden
    arg: Option<BuildArg>,
}

/// Every `ARG` declaration of a definition, resolved against overrides.
#[derive(Debug, Clone, Default)]
pub struct ArgTable {
    global: Vec<Declaration>,
    stages: Vec<Vec<Declaration>>,
    overrides: BTreeMap<String, String>,
}

impl ArgTable {
    /// Folds over `instructions`, recording each `ARG` with its effective
    /// value: the override when supplied, else the declared default.
    pub fn resolve(instructions: &[Instruction], overrides: &BTreeMap<String, String>) -> Self {
        let mut table = ArgTable {
            overrides: overrides.clone(),
            ..Default::default()
        };

        for (position, inst) in instructions.iter().enumerate() {
            match &inst.kind {
                InstructionKind::StageStart { .. } => table.stages.push(Vec::new()),
                InstructionKind::Arg { name, default } => {
                    let arg = match (overrides.get(name), default) {
                        (Some(value), _) => Some(BuildArg {
                            key: name.clone(),
                            value: value.clone(),
                            origin: ArgOrigin::Override,
                        }),
                        (None, Some(value)) => Some(BuildArg {
                            key: name.clone(),
                            value: value.clone(),
                            origin: ArgOrigin::Default,
                        }),
                        // A bare stage-level ARG re-imports the global value.
                        (None, None) if !table.stages.is_empty() => {
                            nearest(&table.global, position, name).flatten().cloned()
                        }
                        (None, None) => None,
                    };
                    let decl = Declaration {
                        position,
                        key: name.clone(),
                        arg,
                    };
                    match table.stages.last_mut() {
                        Some(scope) => scope.push(decl),
                        None => table.global.push(decl),
                    }
                }
                _ => {}
            }
        }

        table
    }

    /// Looks up `name` as seen by the instruction at `position` in `scope`.
    pub fn lookup(&self, scope: Scope, position: usize, name: &str) -> Option<&BuildArg> {
        let local = match scope {
            Scope::Stage(ordinal) => self
                .stages
                .get(ordinal)
                .and_then(|decls| nearest(decls, position, name)),
            Scope::Global => None,
        };

        match local {
            Some(found) => found,
            None => nearest(&self.global, position, name).flatten(),
        }
    }

    /// Substitutes `${NAME}` and `$NAME` in `text`. `escape` followed by `$`
    /// yields a literal `$`. Fails on undeclared or valueless arguments.
    pub fn substitute(
        &self,
        text: &str,
        scope: Scope,
        position: usize,
        line: usize,
        escape: char,
    ) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if c == escape && chars.peek() == Some(&'$') {
                chars.next();
                out.push('$');
                continue;
            }
            if c != '$' {
                out.push(c);
                continue;
            }

            let name = if chars.next_if_eq(&'{').is_some() {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(ScanError::syntax(
                                line,
                                format!("unterminated '${{' in '{text}'"),
                            ));
                        }
                    }
                }
                if !is_valid_arg_name(&name) {
                    return Err(ScanError::syntax(
                        line,
                        format!("unsupported substitution '${{{name}}}' in '{text}'"),
                    ));
                }
                name
            } else {
                let mut name = String::new();
                while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
                    name.push(c);
                }
                if !is_valid_arg_name(&name) {
                    // A lone `$` (or `$` before a digit) is literal text.
                    out.push('$');
                    out.push_str(&name);
                    continue;
                }
                name
            };

            let arg = self
                .lookup(scope, position, &name)
                .ok_or_else(|| ScanError::UnresolvedArgument {
                    name: name.clone(),
                    line,
                })?;
            out.push_str(&arg.value);
        }

        Ok(out)
    }

    /// Final value of every declared argument; the last declaration wins.
    pub fn effective(&self) -> BTreeMap<String, BuildArg> {
        let mut decls: Vec<&Declaration> = self.global.iter().chain(self.stages.iter().flatten()).collect();
        decls.sort_by_key(|d| d.position);

        let mut effective = BTreeMap::new();
        for decl in decls {
            match &decl.arg {
                Some(arg) => {
                    effective.insert(decl.key.clone(), arg.clone());
                }
                None => {
                    effective.remove(&decl.key);
                }
            }
        }
        effective
    }

    /// Overrides that no `ARG` declares.
    pub fn unused_overrides(&self) -> Vec<&str> {
        let declared: BTreeSet<&str> = self
            .global
            .iter()
            .chain(self.stages.iter().flatten())
            .map(|d| d.key.as_str())
            .collect();

        self.overrides
            .keys()
            .map(String::as_str)
            .filter(|k| !declared.contains(k))
            .collect()
    }
}

/// The nearest declaration of `name` before `position`. The inner `None`
/// marks a declaration without a value.
fn nearest<'a>(decls: &'a [Declaration], position: usize, name: &str) -> Option<Option<&'a BuildArg>> {
    decls
        .iter()
        .rev()
        .find(|d| d.position < position && d.key == name)
        .map(|d| d.arg.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::parser::parse;

    fn table(content: &str, overrides: &[(&str, &str)]) -> (Vec<Instruction>, ArgTable) {
        let def = parse(content).unwrap();
        let overrides = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let table = ArgTable::resolve(&def.instructions, &overrides);
        (def.instructions, table)
    }

    #[test]
    fn test_default_and_override() {
        let content = "ARG VERSION=3.18\nFROM alpine:${VERSION}\n";

        let (_, t) = table(content, &[]);
        let arg = t.lookup(Scope::Stage(0), 1, "VERSION").unwrap();
        assert_eq!(arg.value, "3.18");
        assert_eq!(arg.origin, ArgOrigin::Default);

        let (_, t) = table(content, &[("VERSION", "3.19")]);
        let arg = t.lookup(Scope::Stage(0), 1, "VERSION").unwrap();
        assert_eq!(arg.value, "3.19");
        assert_eq!(arg.origin, ArgOrigin::Override);
    }

    #[test]
    fn test_stage_scope_is_not_visible_to_other_stages() {
        // positions: 0 FROM, 1 ARG, 2 FROM
        let (_, t) = table("FROM alpine\nARG TAG=1\nFROM debian\n", &[]);
        assert!(t.lookup(Scope::Stage(0), 2, "TAG").is_some());
        assert!(t.lookup(Scope::Stage(1), 3, "TAG").is_none());
    }

    #[test]
    fn test_global_visible_in_every_stage() {
        let (_, t) = table("ARG REG=ghcr.io\nFROM alpine\nFROM debian\n", &[]);
        assert_eq!(t.lookup(Scope::Stage(0), 2, "REG").unwrap().value, "ghcr.io");
        assert_eq!(t.lookup(Scope::Stage(1), 3, "REG").unwrap().value, "ghcr.io");
    }

    #[test]
    fn test_global_scope_ignores_stage_declarations() {
        // positions: 0 ARG V=1, 1 FROM, 2 ARG V=2, 3 FROM
        let (_, t) = table("ARG V=1\nFROM a\nARG V=2\nFROM b\n", &[]);
        assert_eq!(t.lookup(Scope::Global, 3, "V").unwrap().value, "1");
        assert_eq!(t.lookup(Scope::Stage(0), 3, "V").unwrap().value, "2");
        assert_eq!(t.substitute("b:$V", Scope::Global, 3, 4, '\\').unwrap(), "b:1");
    }

    #[test]
    fn test_nearest_preceding_declaration_wins() {
        // positions: 0 ARG V=1, 1 FROM, 2 ARG V=2, 3 RUN, 4 ARG V=3
        let (_, t) = table("ARG V=1\nFROM a\nARG V=2\nRUN x\nARG V=3\n", &[]);
        assert_eq!(t.lookup(Scope::Stage(0), 2, "V").unwrap().value, "1");
        assert_eq!(t.lookup(Scope::Stage(0), 3, "V").unwrap().value, "2");
        assert_eq!(t.lookup(Scope::Stage(0), 5, "V").unwrap().value, "3");
    }

    #[test]
    fn test_reference_before_declaration_is_unresolved() {
        let (_, t) = table("FROM a\nRUN x\nARG LATE=1\n", &[]);
        assert!(t.lookup(Scope::Stage(0), 1, "LATE").is_none());
    }

    #[test]
    fn test_bare_stage_arg_reimports_global() {
        let (_, t) = table("ARG V=1\nFROM a\nARG V\n", &[]);
        assert_eq!(t.lookup(Scope::Stage(0), 3, "V").unwrap().value, "1");
        let (_, t) = table("ARG V=1\nFROM a\nARG V\n", &[("V", "9")]);
        assert_eq!(t.lookup(Scope::Stage(0), 3, "V").unwrap().value, "9");
    }

    #[test]
    fn test_bare_stage_arg_without_global_has_no_value() {
        let (_, t) = table("ARG V=1\nFROM a\nARG W\n", &[]);
        assert!(t.lookup(Scope::Stage(0), 3, "W").is_none());
    }

    #[test]
    fn test_substitute_forms() {
        let (_, t) = table("ARG REPO=alpine\nARG TAG=3.18\nFROM x\n", &[]);
        let s = |text: &str| t.substitute(text, Scope::Stage(0), 2, 3, '\\');

        assert_eq!(s("${REPO}:${TAG}").unwrap(), "alpine:3.18");
        assert_eq!(s("$REPO:$TAG").unwrap(), "alpine:3.18");
        assert_eq!(s("docker.io/library/${REPO}").unwrap(), "docker.io/library/alpine");
        assert_eq!(s("plain:1").unwrap(), "plain:1");
        assert_eq!(s("a\\$REPO").unwrap(), "a$REPO");
        assert_eq!(s("cost$").unwrap(), "cost$");
    }

    #[test]
    fn test_substitute_errors() {
        let (_, t) = table("ARG EMPTY\nFROM x\n", &[]);
        let s = |text: &str| t.substitute(text, Scope::Stage(0), 1, 7, '\\');

        match s("alpine:${MISSING}") {
            Err(ScanError::UnresolvedArgument { name, line }) => {
                assert_eq!(name, "MISSING");
                assert_eq!(line, 7);
            }
            other => panic!("expected unresolved argument, got {other:?}"),
        }
        assert!(matches!(s("$EMPTY"), Err(ScanError::UnresolvedArgument { .. })));
        assert!(matches!(s("alpine:${TAG"), Err(ScanError::Syntax { line: 7, .. })));
        assert!(matches!(s("${TAG:-1}"), Err(ScanError::Syntax { .. })));
    }

    #[test]
    fn test_effective_and_unused_overrides() {
        let (_, t) = table(
            "ARG A=1\nFROM x\nARG B\nARG A=2\n",
            &[("B", "b"), ("UNUSED", "u")],
        );

        let effective = t.effective();
        assert_eq!(effective["A"].value, "2");
        assert_eq!(effective["B"].value, "b");
        assert_eq!(effective["B"].origin, ArgOrigin::Override);
        assert_eq!(t.unused_overrides(), vec!["UNUSED"]);
    }
}
