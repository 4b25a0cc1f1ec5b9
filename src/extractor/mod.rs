//! Instruction extraction from exercise markup.
//!
//! Content is a directory of chapter files (or a single file) produced by
//! unpacking a course book. Each exercise starts at an anchor whose id is the
//! exercise id, optionally followed by a `-ge` or `-lab` marker.

use log::{debug, info, warn};
use scraper::Html;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub mod classifier;
pub mod filename;
pub mod markup;
pub mod model;


pub use classifier::{BlockClass, Classifier, CodeBlock};
pub use filename::BlockContext;
pub use model::{
    Command, ExerciseInstructions, ExerciseSummary, ExerciseType, ExtractionOutcome, FileAction,
    FileActionKind, InstructionStep, SetupCommand, StepAction,
};

use crate::error::{Error, Result};
use markup::ExerciseWalk;

const CONTENT_EXTENSIONS: &[&str] = &["xhtml", "html", "htm"];

/// Lists markup files under `content` in sorted order.
///
/// A path to a single file is returned as is.
pub fn discover_content_files(content: &Path) -> Result<Vec<PathBuf>> {
    if content.is_file() {
        return Ok(vec![content.to_path_buf()]);
    }
    if !content.is_dir() {
        return Err(Error::Extraction(format!(
            "content path {} does not exist",
            content.display()
        )));
    }

    let mut files = Vec::new();
    let mut pending = vec![content.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| CONTENT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn read_markup(path: &Path) -> Option<Html> {
    match fs::read_to_string(path) {
        Ok(text) => Some(Html::parse_document(&text)),
        Err(e) => {
            warn!("Skipping {}: {}", path.display(), e);
            None
        }
    }
}

/// Every exercise anchor in the content, in file order.
pub fn list_exercises(content: &Path) -> Result<Vec<ExerciseSummary>> {
    let mut exercises: Vec<ExerciseSummary> = Vec::new();
    for path in discover_content_files(content)? {
        let Some(doc) = read_markup(&path) else {
            continue;
        };
        for anchor in markup::exercise_anchors(&doc) {
            let Some(id) = anchor.value().attr("id") else {
                continue;
            };
            if exercises.iter().any(|e| e.id == id) {
                continue;
            }
            let title = markup::exercise_title(anchor);
            let exercise_type = ExerciseType::from_title(&title).unwrap_or_else(|| ExerciseType::from_id(id));
            exercises.push(ExerciseSummary {
                id: id.to_string(),
                exercise_type,
                title,
                source: path.clone(),
            });
        }
    }
    debug!("Found {} exercises under {}", exercises.len(), content.display());
    Ok(exercises)
}

/// Extracts instruction trees from exercise markup.
pub struct InstructionExtractor {
    classifier: Classifier,
}

impl InstructionExtractor {
    pub fn new(known_passwords: Vec<String>) -> Self {
        Self {
            classifier: Classifier::new(known_passwords),
        }
    }

    /// Parses one exercise out of an already-loaded document.
    pub fn extract_from_html(&self, html: &str, exercise_id: &str) -> Option<ExerciseInstructions> {
        let doc = Html::parse_document(html);
        let anchor = markup::find_anchor(&doc, exercise_id)?;
        Some(ExerciseWalk::new(&self.classifier).run(anchor, exercise_id))
    }

    /// Searches the content for the exercise and extracts its tree.
    ///
    /// Unreadable files are logged and skipped; only a missing anchor across
    /// all files yields [`ExtractionOutcome::NotFound`].
    pub fn extract(&self, content: &Path, exercise_id: &str) -> Result<ExtractionOutcome> {
        let files = discover_content_files(content)?;
        for path in &files {
            let Some(doc) = read_markup(path) else {
                continue;
            };
            let Some(anchor) = markup::find_anchor(&doc, exercise_id) else {
                continue;
            };
            let mut instructions = ExerciseWalk::new(&self.classifier).run(anchor, exercise_id);
            instructions.source = Some(path.clone());
            info!(
                "Extracted {} ({} steps, {} actions) from {}",
                exercise_id,
                instructions.steps.len(),
                instructions.total_commands(),
                path.display()
            );
            return Ok(ExtractionOutcome::Found(Box::new(instructions)));
        }

        warn!("Exercise {} not found in {} files", exercise_id, files.len());
        Ok(ExtractionOutcome::NotFound {
            exercise_id: exercise_id.to_string(),
            files_searched: files.len(),
        })
    }

    /// Extracts several exercises, parsing each content file at most once.
    ///
    /// Outcomes come back in the order of `exercise_ids`.
    pub fn extract_many(&self, content: &Path, exercise_ids: &[String]) -> Result<Vec<ExtractionOutcome>> {
        let files = discover_content_files(content)?;
        let mut found: HashMap<&str, ExerciseInstructions> = HashMap::new();
        for path in &files {
            if exercise_ids.iter().all(|id| found.contains_key(id.as_str())) {
                break;
            }
            let Some(doc) = read_markup(path) else {
                continue;
            };
            for id in exercise_ids {
                if found.contains_key(id.as_str()) {
                    continue;
                }
                let Some(anchor) = markup::find_anchor(&doc, id) else {
                    continue;
                };
                let mut instructions = ExerciseWalk::new(&self.classifier).run(anchor, id);
                instructions.source = Some(path.clone());
                debug!("Extracted {} from {}", id, path.display());
                found.insert(id.as_str(), instructions);
            }
        }

        info!("Extracted {} of {} exercises from {} files", found.len(), exercise_ids.len(), files.len());
        Ok(exercise_ids
            .iter()
            .map(|id| match found.remove(id.as_str()) {
                Some(instructions) => ExtractionOutcome::Found(Box::new(instructions)),
                None => ExtractionOutcome::NotFound {
                    exercise_id: id.clone(),
                    files_searched: files.len(),
                },
            })
            .collect())
    }
}

/// Extracted trees keyed by content path, then exercise id.
///
/// Owned by the caller; nothing is cached for the lifetime of the process.
#[derive(Debug, Default)]
pub struct ExerciseCache {
    entries: HashMap<PathBuf, HashMap<String, ExerciseInstructions>>,
}

impl ExerciseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, content: &Path, exercise_id: &str) -> Option<&ExerciseInstructions> {
        self.entries.get(content).and_then(|m| m.get(exercise_id))
    }

    /// Returns the cached tree or extracts and caches it.
    pub fn get_or_extract(
        &mut self,
        extractor: &InstructionExtractor,
        content: &Path,
        exercise_id: &str,
    ) -> Result<ExtractionOutcome> {
        if let Some(cached) = self.get(content, exercise_id) {
            debug!("Cache hit for {} in {}", exercise_id, content.display());
            return Ok(ExtractionOutcome::Found(Box::new(cached.clone())));
        }
        let outcome = extractor.extract(content, exercise_id)?;
        if let ExtractionOutcome::Found(instructions) = &outcome {
            self.entries
                .entry(content.to_path_buf())
                .or_default()
                .insert(exercise_id.to_string(), (**instructions).clone());
        }
        Ok(outcome)
    }

    /// Drops every tree extracted from `content`.
    pub fn invalidate(&mut self, content: &Path) -> usize {
        self.entries.remove(content).map(|m| m.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
