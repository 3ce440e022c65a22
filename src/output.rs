//! Result types returned by [`crate::convert::convert`].

use crate::exam::ExamDocument;
use crate::pipeline::ocr::OcrEntry;
use crate::validate::ValidationReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One step of a conversion run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Unpack the DOCX and recover paragraphs, relationships and images.
    Parse,
    /// Copy media entries to the run's image directory.
    ExtractImages,
    /// Deduplicate and rasterise WMF/EMF formulas.
    Formulas,
    /// Recognise rasterised formulas as LaTeX.
    Recognition,
    /// Call the AI CLI and repair its JSON.
    Model,
    /// Check the stamped result against the exam schema rules.
    Validate,
    /// Write `result.json`.
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::ExtractImages => "extract images",
            Stage::Formulas => "render formulas",
            Stage::Recognition => "recognise formulas",
            Stage::Model => "model call",
            Stage::Validate => "validate",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Wall-clock duration of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
}

/// Per-stage timings for a run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub stages: Vec<StageTiming>,
    pub total_ms: u64,
}

impl StageTimings {
    pub fn record(&mut self, stage: Stage, duration_ms: u64) {
        self.stages.push(StageTiming { stage, duration_ms });
    }

    /// Duration of `stage`, if it ran.
    pub fn get(&self, stage: Stage) -> Option<u64> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.duration_ms)
    }
}

/// Formula pipeline counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaStats {
    /// Formula references found in the document (including repeats).
    pub referenced: usize,
    /// Distinct formula contents after hashing.
    pub unique: usize,
    /// References that ended up with a rendered PNG.
    pub converted: usize,
    /// References resolved by a recogniser rather than a fallback marker.
    pub recognised: usize,
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    /// Unique id of this run; also the name of its output directory.
    pub run_id: String,
    /// The stamped exam document.
    pub exam: ExamDocument,
    /// Advisory schema findings; never blocks delivery.
    pub report: ValidationReport,
    /// Where `result.json` was written, when persistence is enabled.
    pub output_path: Option<PathBuf>,
    /// Media files copied out of the document, when image extraction is enabled.
    pub image_paths: Vec<PathBuf>,
    /// Recognition entries keyed by formula id, in id order.
    pub ocr: Vec<OcrEntry>,
    pub formula_stats: FormulaStats,
    pub timings: StageTimings,
}
