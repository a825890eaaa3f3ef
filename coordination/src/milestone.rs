//! Milestone catalog and line matcher
//!
//! Maps one line of unstructured provisioning/build output to at most one
//! ranked [`Milestone`]. The catalog is split in two tiers that are evaluated
//! in order: container lifecycle lines are checked before domain build lines,
//! because lifecycle output routinely embeds image metadata that mentions
//! build tools (`Pulling from .../dotnet build-image`) and must not be read as
//! a build step.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Docker build step counters: "[5/17] RUN apt-get ..."
static BUILD_STEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+)/(\d+)\]").expect("BUILD_STEP_RE regex should compile")
});

/// A named progress marker inferred from output text.
///
/// Variants are declared in rank order; `rank()` is the catalog position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    PullingImage,
    BuildingImage,
    CreatingContainer,
    ContainerStarted,
    PostCreateSetup,
    PostStartSetup,
    BuildingParsers,
    RestoringPackages,
    Compiling,
    BuildSucceeded,
    StartingServer,
    Ready,
}

/// Evaluation tier of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneTier {
    /// Container image and lifecycle hook events
    Lifecycle,
    /// Build and server events emitted from inside the workspace
    Domain,
}

/// One row of the catalog: a milestone, its tier, and its keyword predicate.
pub struct CatalogEntry {
    pub milestone: Milestone,
    pub tier: MilestoneTier,
    /// Predicate over the trimmed, lowercased line
    matches: fn(&str) -> bool,
}

impl CatalogEntry {
    pub fn matches(&self, lower: &str) -> bool {
        (self.matches)(lower)
    }
}

/// The milestone catalog, ordered by rank.
pub static CATALOG: [CatalogEntry; 12] = [
    CatalogEntry {
        milestone: Milestone::PullingImage,
        tier: MilestoneTier::Lifecycle,
        matches: |l| l.contains("pulling from") || l.contains("pull complete"),
    },
    CatalogEntry {
        milestone: Milestone::BuildingImage,
        tier: MilestoneTier::Lifecycle,
        matches: |l| l.contains("step ") && l.contains("run ") && !l.contains("docker"),
    },
    CatalogEntry {
        milestone: Milestone::CreatingContainer,
        tier: MilestoneTier::Lifecycle,
        matches: |l| l.contains("start: run: docker run"),
    },
    CatalogEntry {
        milestone: Milestone::ContainerStarted,
        tier: MilestoneTier::Lifecycle,
        matches: |l| l.contains("start: run: docker start"),
    },
    CatalogEntry {
        milestone: Milestone::PostCreateSetup,
        tier: MilestoneTier::Lifecycle,
        matches: |l| l.contains("running the postcreatecommand"),
    },
    CatalogEntry {
        milestone: Milestone::PostStartSetup,
        tier: MilestoneTier::Lifecycle,
        matches: |l| l.contains("running the poststartcommand"),
    },
    CatalogEntry {
        milestone: Milestone::BuildingParsers,
        tier: MilestoneTier::Domain,
        matches: |l| l.contains("tree-sitter") || l.contains("tree_sitter"),
    },
    CatalogEntry {
        milestone: Milestone::RestoringPackages,
        tier: MilestoneTier::Domain,
        matches: |l| l.contains("restoring"),
    },
    CatalogEntry {
        milestone: Milestone::Compiling,
        tier: MilestoneTier::Domain,
        matches: |l| l.contains("dotnet build") || (l.contains(".sln") && !l.contains("docker")),
    },
    CatalogEntry {
        milestone: Milestone::BuildSucceeded,
        tier: MilestoneTier::Domain,
        matches: |l| l.contains("build succeeded"),
    },
    CatalogEntry {
        milestone: Milestone::StartingServer,
        tier: MilestoneTier::Domain,
        matches: |l| l.contains("build-server") || l.contains("now listening on:"),
    },
    CatalogEntry {
        milestone: Milestone::Ready,
        tier: MilestoneTier::Domain,
        matches: |l| {
            l.contains("shipit ready")
                || l.contains("ready to ship")
                || l.contains("initial compile succeeded")
                || l.contains("done reloading packages")
        },
    },
];

const TIER_ORDER: [MilestoneTier; 2] = [MilestoneTier::Lifecycle, MilestoneTier::Domain];

impl Milestone {
    /// Catalog rank, starting at 1. Zero is reserved for "nothing seen yet".
    pub fn rank(self) -> u32 {
        self as u32 + 1
    }

    pub fn tier(self) -> MilestoneTier {
        CATALOG[self as usize].tier
    }

    /// Short display label
    pub fn label(self) -> &'static str {
        match self {
            Self::PullingImage => "pulling image",
            Self::BuildingImage => "building image",
            Self::CreatingContainer => "creating container",
            Self::ContainerStarted => "container started",
            Self::PostCreateSetup => "post-create setup",
            Self::PostStartSetup => "post-start setup",
            Self::BuildingParsers => "building parsers",
            Self::RestoringPackages => "restoring packages",
            Self::Compiling => "compiling",
            Self::BuildSucceeded => "build succeeded",
            Self::StartingServer => "starting server",
            Self::Ready => "ready",
        }
    }

    /// Number of milestones in the catalog
    pub fn count() -> usize {
        CATALOG.len()
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Match one line against the catalog.
///
/// The first tier with any match wins; inside that tier the highest-ranked
/// match is returned.
pub fn match_line(line: &str) -> Option<Milestone> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();

    TIER_ORDER.iter().find_map(|tier| {
        CATALOG
            .iter()
            .rev()
            .filter(|entry| entry.tier == *tier)
            .find(|entry| entry.matches(&lower))
            .map(|entry| entry.milestone)
    })
}

/// Image build step counter ("[5/17]"), reported separately from milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub current: u32,
    pub total: u32,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build [{}/{}]", self.current, self.total)
    }
}

/// Extract a `[n/m]` build step counter from a line, if present.
pub fn parse_build_step(line: &str) -> Option<BuildStep> {
    let caps = BUILD_STEP_RE.captures(line)?;
    let current = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    if total == 0 || current > total {
        return None;
    }
    Some(BuildStep { current, total })
}
