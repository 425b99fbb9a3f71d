//! Stage graph for a parsed Dockerfile.
//!
//! Each `FROM` becomes a [`Stage`] whose base image has all build arguments
//! substituted. A base that names an earlier stage chains to it; following
//! the chain leads to the external image the stage is really built on.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use super::args::{ArgTable, Scope};
use super::parser::{Definition, InstructionKind};
use super::reference::ImageReference;
use crate::error::{Result, ScanError};

/// What a stage is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageBase {
    /// A registry image
    External,
    /// The reserved empty image
    Scratch,
    /// Another stage, by ordinal
    Stage(usize),
}

/// A `COPY --from` source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    Stage(usize),
    External(ImageReference),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub ordinal: usize,
    pub name: Option<String>,
    pub platform: Option<String>,
    pub base_image_raw: String,
    pub base_image_resolved: ImageReference,
    pub base: StageBase,
    pub copy_sources: Vec<CopySource>,
}

impl Stage {
    /// Stage name, or its ordinal for unnamed stages.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.ordinal.to_string())
    }
}

/// Which set an image used both by the target and by other stages goes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Report it as runtime only
    #[default]
    RuntimeWins,
    /// Report it in both sets
    ReportBoth,
}

/// External images split by whether they end up in the final artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub build_time: Vec<ImageReference>,
    pub runtime: Vec<ImageReference>,
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    pub stages: Vec<Stage>,
}

impl StageGraph {
    /// Builds and validates the stage graph.
    ///
    /// Fails if an image reference cannot be resolved or parsed, or if any
    /// stage (or `COPY --from`) depends on itself or on a later stage.
    pub fn build(definition: &Definition, args: &ArgTable) -> Result<Self> {
        let names: Vec<Option<&str>> = definition
            .instructions
            .iter()
            .filter_map(|inst| match &inst.kind {
                InstructionKind::StageStart { name, .. } => Some(name.as_deref()),
                _ => None,
            })
            .collect();

        let mut stages: Vec<Stage> = Vec::with_capacity(names.len());

        for (position, inst) in definition.instructions.iter().enumerate() {
            match &inst.kind {
                InstructionKind::StageStart {
                    image,
                    name,
                    platform,
                } => {
                    let ordinal = stages.len();
                    // FROM only sees arguments declared before the first FROM.
                    let resolved = args.substitute(
                        image,
                        Scope::Global,
                        position,
                        inst.line,
                        definition.escape,
                    )?;
                    let reference = ImageReference::parse(&resolved)
                        .map_err(|e| ScanError::syntax(inst.line, e.to_string()))?;

                    // A stage cannot be its own base: `FROM node AS node`
                    // names the registry image.
                    let base = if reference.is_scratch() {
                        StageBase::Scratch
                    } else {
                        match stage_ref(&names, ordinal, &reference) {
                            Some(target) if target != ordinal => StageBase::Stage(target),
                            _ => StageBase::External,
                        }
                    };
                    if base == StageBase::External {
                        reference
                            .check_grammar()
                            .map_err(|e| ScanError::syntax(inst.line, e.to_string()))?;
                    }

                    debug!(
                        ordinal,
                        name = name.as_deref().unwrap_or("-"),
                        image = %reference,
                        ?base,
                        "Resolved stage"
                    );

                    stages.push(Stage {
                        ordinal,
                        name: name.clone(),
                        platform: platform.clone(),
                        base_image_raw: image.clone(),
                        base_image_resolved: reference,
                        base,
                        copy_sources: Vec::new(),
                    });
                }
                InstructionKind::CopyFrom { source } => {
                    let Some(ordinal) = stages.len().checked_sub(1) else {
                        continue;
                    };
                    let resolved = args.substitute(
                        source,
                        Scope::Stage(ordinal),
                        position,
                        inst.line,
                        definition.escape,
                    )?;
                    let reference = ImageReference::parse(&resolved)
                        .map_err(|e| ScanError::syntax(inst.line, e.to_string()))?;

                    let copy = match stage_ref(&names, ordinal, &reference) {
                        Some(target) => CopySource::Stage(target),
                        None => {
                            reference
                                .check_grammar()
                                .map_err(|e| ScanError::syntax(inst.line, e.to_string()))?;
                            CopySource::External(reference)
                        }
                    };
                    stages[ordinal].copy_sources.push(copy);
                }
                _ => {}
            }
        }

        if stages.is_empty() {
            return Err(ScanError::syntax(1, "build definition has no FROM instruction"));
        }

        let graph = StageGraph { stages };
        for stage in &graph.stages {
            graph.external_root(stage.ordinal)?;
            for copy in &stage.copy_sources {
                if let CopySource::Stage(source) = copy {
                    if *source >= stage.ordinal {
                        return Err(graph.cyclic(stage.ordinal));
                    }
                }
            }
        }

        Ok(graph)
    }

    /// Follows chain links from `ordinal` to the first stage not built on
    /// another stage. The walk is bounded by the stage count.
    pub fn external_root(&self, ordinal: usize) -> Result<usize> {
        let mut visited = BTreeSet::new();
        let mut current = ordinal;

        for _ in 0..=self.stages.len() {
            if !visited.insert(current) {
                return Err(self.cyclic(current));
            }
            match self.stages[current].base {
                StageBase::Stage(parent) if parent >= current => return Err(self.cyclic(current)),
                StageBase::Stage(parent) => current = parent,
                StageBase::External | StageBase::Scratch => return Ok(current),
            }
        }

        Err(self.cyclic(ordinal))
    }

    /// Resolves the target stage: by name, by ordinal, or the last stage.
    pub fn target_ordinal(&self, target: Option<&str>) -> Result<usize> {
        let Some(target) = target else {
            return Ok(self.stages.len().saturating_sub(1));
        };

        self.stages
            .iter()
            .position(|s| s.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(target)))
            .or_else(|| target.parse::<usize>().ok().filter(|&i| i < self.stages.len()))
            .ok_or_else(|| ScanError::TargetNotFound {
                target: target.to_string(),
            })
    }

    /// Splits the external images into runtime (the target's root) and
    /// build-time (every other stage's root plus `COPY --from` images).
    pub fn dependencies(&self, target: Option<&str>, overlap: OverlapPolicy) -> Result<Dependencies> {
        let target = self.target_ordinal(target)?;
        let mut runtime = ImageSet::default();
        let mut build_time = ImageSet::default();

        for stage in &self.stages {
            let root = &self.stages[self.external_root(stage.ordinal)?];
            if root.base == StageBase::External {
                let set = if stage.ordinal == target {
                    &mut runtime
                } else {
                    &mut build_time
                };
                set.insert(&root.base_image_resolved);
            }

            for copy in &stage.copy_sources {
                if let CopySource::External(reference) = copy {
                    if !reference.is_scratch() {
                        build_time.insert(reference);
                    }
                }
            }
        }

        if overlap == OverlapPolicy::RuntimeWins {
            build_time.remove_all(&runtime);
        }

        Ok(Dependencies {
            build_time: build_time.images,
            runtime: runtime.images,
        })
    }

    fn cyclic(&self, ordinal: usize) -> ScanError {
        ScanError::CyclicStageReference {
            stage: self.stages[ordinal].label(),
        }
    }
}

/// Ordinal of the stage `reference` names, if any. Bare numbers address
/// earlier stages only; anything else matches stage names case-insensitively.
fn stage_ref(names: &[Option<&str>], current: usize, reference: &ImageReference) -> Option<usize> {
    if !reference.is_bare() {
        return None;
    }
    let text = reference.raw.as_str();

    if text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse::<usize>().ok().filter(|&i| i < current);
    }

    names
        .iter()
        .position(|n| n.is_some_and(|n| n.eq_ignore_ascii_case(text)))
}

/// Insertion-ordered set keyed by the normalized reference.
#[derive(Default)]
struct ImageSet {
    images: Vec<ImageReference>,
    keys: HashSet<String>,
}

impl ImageSet {
    fn insert(&mut self, reference: &ImageReference) {
        if self.keys.insert(reference.normalized()) {
            self.images.push(reference.clone());
        }
    }

    fn remove_all(&mut self, other: &ImageSet) {
        self.images.retain(|r| !other.keys.contains(&r.normalized()));
        self.keys.retain(|k| !other.keys.contains(k));
    }
}
