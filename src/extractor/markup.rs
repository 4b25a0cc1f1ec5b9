//! Traversal of exercise markup.
//!
//! Locates an exercise anchor, walks forward through its sections while
//! tracking which part of the exercise is being read, and turns the
//! instruction list into numbered steps. Code blocks are handed to the
//! [`Classifier`] as flat [`CodeBlock`]s.

use log::debug;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

use super::classifier::{BlockClass, Classifier, CodeBlock};
use super::filename::BlockContext;
use super::model::{
    ExerciseInstructions, ExerciseType, FileActionKind, InstructionStep, SetupCommand, StepAction,
};

const ADMONITIONS: &[&str] = &["note", "warning", "important", "tip", "caution"];
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "pre", "ol", "ul", "figure", "table", "blockquote", "dl", "aside",
];
const LITERAL_CLASSES: &[&str] = &["filename", "literal", "command"];

/// Type markers an anchor id may carry after the exercise id.
pub const TYPE_MARKERS: &[&str] = &["-ge", "-lab"];

static ID_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[id]").expect("id selector is valid"));

static LEAD_SPAN: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".step-title, span.title").expect("lead span selector is valid"));

static SETUP_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\blab\s+start\s+(?:-t\s+(\S+)\s+)?([A-Za-z0-9_.-]+)").expect("setup command regex is valid")
});

static SECTION_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(outcomes?|instructions|procedure|before you begin|finish|evaluation)\b")
        .expect("section label regex is valid")
});

static VERIFICATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(verify|verifies|verifying|confirm|confirms|check|checks|ensure|ensures|validate|validates)\b")
        .expect("verification regex is valid")
});

fn heading_level(el: ElementRef) -> Option<u8> {
    match el.value().name() {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn has_any_class(el: ElementRef, classes: &[&str]) -> bool {
    el.value().classes().any(|c| classes.contains(&c))
}

fn is_admonition(el: ElementRef) -> bool {
    el.value().name() == "aside" || has_any_class(el, ADMONITIONS)
}

fn is_typed(el: ElementRef) -> bool {
    matches!(el.value().name(), "strong" | "b") || has_any_class(el, &["userinput"])
}

fn is_container(el: ElementRef) -> bool {
    matches!(el.value().name(), "section" | "div" | "article" | "body")
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn append_prose(el: ElementRef, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child) = ElementRef::wrap(child) {
            append_inline(child, out);
        }
    }
}

fn append_inline(el: ElementRef, out: &mut String) {
    match el.value().name() {
        "pre" | "ol" | "ul" | "table" => {}
        "br" => out.push(' '),
        "code" | "tt" => wrap_literal(el, out),
        _ if has_any_class(el, LITERAL_CLASSES) => wrap_literal(el, out),
        _ => append_prose(el, out),
    }
}

fn wrap_literal(el: ElementRef, out: &mut String) {
    out.push('`');
    out.push_str(el.text().collect::<String>().trim());
    out.push('`');
}

/// Readable text of an element, inline code wrapped in backticks.
pub fn prose_text(el: ElementRef) -> String {
    let mut out = String::new();
    append_prose(el, &mut out);
    normalize(&out)
}

fn inline_text(el: ElementRef) -> String {
    let mut out = String::new();
    append_inline(el, &mut out);
    normalize(&out)
}

fn append_code(el: ElementRef, typed: bool, block: &mut CodeBlock) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            block.push(text, typed);
        } else if let Some(child) = ElementRef::wrap(child) {
            if child.value().name() == "br" {
                block.push("\n", typed);
            } else {
                append_code(child, typed || is_typed(child), block);
            }
        }
    }
}

/// Flattens a `<pre>` element into a [`CodeBlock`].
pub fn code_block(pre: ElementRef) -> CodeBlock {
    let mut block = CodeBlock::new();
    append_code(pre, false, &mut block);
    block
}

/// Step label for a 0-based position at a 1-based list depth.
pub fn step_label(depth: usize, index: usize) -> String {
    match depth {
        2 => letters(index),
        3 => roman(index + 1),
        _ => (index + 1).to_string(),
    }
}

fn letters(mut index: usize) -> String {
    let mut label = Vec::new();
    loop {
        label.push(b'a' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

fn roman(mut n: usize) -> String {
    const NUMERALS: &[(usize, &str)] = &[
        (1000, "m"),
        (900, "cm"),
        (500, "d"),
        (400, "cd"),
        (100, "c"),
        (90, "xc"),
        (50, "l"),
        (40, "xl"),
        (10, "x"),
        (9, "ix"),
        (5, "v"),
        (4, "iv"),
        (1, "i"),
    ];
    let mut out = String::new();
    for &(value, numeral) in NUMERALS {
        while n >= value {
            out.push_str(numeral);
            n -= value;
        }
    }
    out
}

/// Parses the `lab start [-t <profile>] <name>` invocation out of `text`.
pub fn parse_setup_command(text: &str) -> Option<SetupCommand> {
    SETUP_COMMAND.captures(text).map(|caps| SetupCommand {
        command: caps[0].to_string(),
        lab_name: caps[2].to_string(),
        profile: caps.get(1).map(|m| m.as_str().to_string()),
    })
}

/// Finds the element whose id is the exercise id, with or without a type
/// marker.
pub fn find_anchor<'a>(doc: &'a Html, exercise_id: &str) -> Option<ElementRef<'a>> {
    let mut candidates = vec![exercise_id.to_string()];
    candidates.extend(TYPE_MARKERS.iter().map(|m| format!("{}{}", exercise_id, m)));
    candidates.iter().find_map(|candidate| {
        doc.select(&ID_SELECTOR)
            .find(|el| el.value().attr("id") == Some(candidate.as_str()))
    })
}

/// Every element whose id carries an exercise type marker.
pub fn exercise_anchors(doc: &Html) -> Vec<ElementRef<'_>> {
    doc.select(&ID_SELECTOR)
        .filter(|el| {
            el.value()
                .attr("id")
                .map(|id| TYPE_MARKERS.iter().any(|m| id.ends_with(m)))
                .unwrap_or(false)
        })
        .collect()
}

/// The heading that titles the exercise at `anchor`.
pub fn exercise_heading(anchor: ElementRef<'_>) -> Option<ElementRef<'_>> {
    if heading_level(anchor).is_some() {
        return Some(anchor);
    }
    if let Some(heading) = anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| heading_level(*el).is_some())
    {
        return Some(heading);
    }
    if is_container(anchor) {
        return anchor.descendants().filter_map(ElementRef::wrap).find(|el| heading_level(*el).is_some());
    }
    anchor
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .filter(|el| heading_level(*el).is_some())
}

pub fn exercise_title(anchor: ElementRef) -> String {
    exercise_heading(anchor).map(prose_text).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Preamble,
    Outcomes,
    Instructions,
    Other,
}

/// Builds the instruction tree for one exercise.
pub struct ExerciseWalk<'c> {
    classifier: &'c Classifier,
    mode: Mode,
    title: Option<String>,
    outcomes: Vec<String>,
    setup: Option<SetupCommand>,
    steps: Option<Vec<InstructionStep>>,
}

/// Content of one list item, split into prose/code blocks and nested lists.
#[derive(Default)]
struct ItemContent<'a> {
    blocks: Vec<Block>,
    lists: Vec<ElementRef<'a>>,
    lead_span: Option<String>,
}

enum Block {
    Prose(String),
    Code(CodeBlock),
}

impl<'c> ExerciseWalk<'c> {
    pub fn new(classifier: &'c Classifier) -> Self {
        Self {
            classifier,
            mode: Mode::Preamble,
            title: None,
            outcomes: Vec::new(),
            setup: None,
            steps: None,
        }
    }

    /// Walks the exercise starting at `anchor` and returns its tree.
    pub fn run(mut self, anchor: ElementRef, exercise_id: &str) -> ExerciseInstructions {
        let anchor_id = anchor.value().attr("id").unwrap_or(exercise_id).to_string();

        if is_container(anchor) && heading_level(anchor).is_none() {
            self.visit(anchor);
        } else if let Some(heading) = exercise_heading(anchor) {
            let level = heading_level(heading).unwrap_or(1);
            self.visit(heading);
            for sibling in heading.next_siblings().filter_map(ElementRef::wrap) {
                if heading_level(sibling).map(|l| l <= level).unwrap_or(false) {
                    break;
                }
                if sibling
                    .value()
                    .attr("id")
                    .map(|id| id != anchor_id && TYPE_MARKERS.iter().any(|m| id.ends_with(m)))
                    .unwrap_or(false)
                {
                    break;
                }
                self.visit(sibling);
            }
        } else {
            self.visit(anchor);
        }

        let title = self.title.unwrap_or_default();
        let exercise_type = ExerciseType::from_title(&title).unwrap_or_else(|| ExerciseType::from_id(&anchor_id));
        ExerciseInstructions {
            exercise_id: exercise_id.to_string(),
            exercise_type,
            title,
            outcomes: self.outcomes,
            setup: self.setup,
            steps: self.steps.unwrap_or_default(),
            source: None,
        }
    }

    fn set_mode_from_label(&mut self, text: &str) -> bool {
        let Some(caps) = SECTION_LABEL.captures(text) else {
            return false;
        };
        let label = caps[1].to_lowercase();
        self.mode = match label.as_str() {
            "outcome" | "outcomes" => Mode::Outcomes,
            "instructions" | "procedure" => Mode::Instructions,
            "before you begin" => Mode::Preamble,
            _ => Mode::Other,
        };
        true
    }

    fn visit(&mut self, el: ElementRef) {
        if is_admonition(el) {
            return;
        }
        let name = el.value().name();

        if heading_level(el).is_some() {
            let text = prose_text(el);
            if self.title.is_none() {
                self.title = Some(text);
            } else {
                self.set_mode_from_label(&text);
            }
            return;
        }

        if name == "p" {
            let text = prose_text(el);
            if text.len() <= 40 && self.set_mode_from_label(&text) {
                return;
            }
        }

        if name == "pre" {
            if self.setup.is_none() && self.mode != Mode::Instructions {
                let text: String = el.text().collect();
                self.setup = parse_setup_command(&text);
            }
            return;
        }

        if has_any_class(el, &["procedure"]) && !matches!(name, "ol" | "ul") {
            self.mode = Mode::Instructions;
        }

        if matches!(name, "ol" | "ul") {
            if self.mode == Mode::Outcomes {
                self.outcomes.extend(
                    el.children()
                        .filter_map(ElementRef::wrap)
                        .filter(|li| li.value().name() == "li")
                        .map(prose_text),
                );
                return;
            }
            if (self.mode == Mode::Instructions || has_any_class(el, &["procedure"])) && self.steps.is_none() {
                let items: Vec<ElementRef> = list_items(el);
                self.steps = Some(self.parse_items(&items, 1, None, &[]));
                return;
            }
        }

        for child in el.children().filter_map(ElementRef::wrap) {
            self.visit(child);
        }
    }

    fn parse_items(
        &self,
        items: &[ElementRef],
        depth: usize,
        parent: Option<&str>,
        ancestors: &[String],
    ) -> Vec<InstructionStep> {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let label = step_label(depth, index);
                let number = match parent {
                    Some(parent) => format!("{}.{}", parent, label),
                    None => label,
                };
                self.parse_step(*item, number, depth, ancestors)
            })
            .collect()
    }

    fn parse_step(&self, item: ElementRef, number: String, depth: usize, ancestors: &[String]) -> InstructionStep {
        let mut content = ItemContent::default();
        collect_item(item, &mut content);

        let lead = content.lead_span.clone().unwrap_or_else(|| {
            content
                .blocks
                .iter()
                .find_map(|b| match b {
                    Block::Prose(text) => Some(text.clone()),
                    Block::Code(_) => None,
                })
                .unwrap_or_default()
        });
        let is_verification = VERIFICATION.is_match(&lead);

        let ancestor_leads: Vec<String> = ancestors.iter().rev().cloned().collect();
        let actions = self.collect_actions(&number, &content.blocks, &lead, &ancestor_leads);

        let mut child_ancestors = ancestors.to_vec();
        child_ancestors.push(lead.clone());
        let nested: Vec<ElementRef> = content.lists.iter().flat_map(|list| list_items(*list)).collect();
        let substeps = self.parse_items(&nested, depth + 1, Some(&number), &child_ancestors);

        InstructionStep {
            number,
            lead,
            is_verification,
            actions,
            substeps,
        }
    }

    fn collect_actions(
        &self,
        number: &str,
        blocks: &[Block],
        lead: &str,
        ancestor_leads: &[String],
    ) -> Vec<StepAction> {
        let mut actions = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            let Block::Code(code) = block else {
                continue;
            };
            let ctx = BlockContext {
                preceding: prose_blocks(blocks[..index].iter().rev()),
                lead: lead.to_string(),
                following: prose_blocks(blocks[index + 1..].iter()),
                ancestor_leads: ancestor_leads.to_vec(),
            };
            match self.classifier.classify(code, &ctx) {
                BlockClass::Commands { commands, .. } => {
                    actions.extend(commands.into_iter().map(StepAction::Command));
                }
                BlockClass::File { action, evidence } => {
                    if action.kind == FileActionKind::Modify {
                        debug!(
                            "Step {}: dropping modification of {} ({})",
                            number,
                            action.filename,
                            evidence.join("; ")
                        );
                    } else {
                        actions.push(StepAction::File(action));
                    }
                }
                BlockClass::Neither { evidence } => {
                    debug!("Step {}: skipping code block ({})", number, evidence.join("; "));
                }
            }
        }
        actions
    }
}

fn list_items(list: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    list.children()
        .filter_map(ElementRef::wrap)
        .filter(|li| li.value().name() == "li")
        .collect()
}

fn prose_blocks<'b>(blocks: impl Iterator<Item = &'b Block>) -> Vec<String> {
    blocks
        .filter_map(|b| match b {
            Block::Prose(text) => Some(text.clone()),
            Block::Code(_) => None,
        })
        .collect()
}

fn flush_inline(pending: &mut String, content: &mut ItemContent) {
    let text = normalize(pending);
    if !text.is_empty() {
        content.blocks.push(Block::Prose(text));
    }
    pending.clear();
}

fn collect_item<'a>(el: ElementRef<'a>, content: &mut ItemContent<'a>) {
    let mut pending = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            pending.push_str(text);
            continue;
        }
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child.value().name();
        if !BLOCK_ELEMENTS.contains(&name) {
            if content.lead_span.is_none() {
                content.lead_span = child.select(&LEAD_SPAN).next().map(prose_text).or_else(|| {
                    has_any_class(child, &["step-title"]).then(|| inline_text(child))
                });
            }
            pending.push(' ');
            pending.push_str(&inline_text(child));
            continue;
        }

        flush_inline(&mut pending, content);
        if is_admonition(child) {
            continue;
        }
        match name {
            "ol" | "ul" => content.lists.push(child),
            "pre" => content.blocks.push(Block::Code(code_block(child))),
            "p" => {
                if content.lead_span.is_none() {
                    content.lead_span = child.select(&LEAD_SPAN).next().map(prose_text);
                }
                let text = prose_text(child);
                if !text.is_empty() {
                    content.blocks.push(Block::Prose(text));
                }
            }
            _ => collect_item(child, content),
        }
    }
    flush_inline(&mut pending, content);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_labels() {
        assert_eq!(step_label(1, 0), "1");
        assert_eq!(step_label(1, 11), "12");
        assert_eq!(step_label(2, 0), "a");
        assert_eq!(step_label(2, 25), "z");
        assert_eq!(step_label(2, 26), "aa");
        assert_eq!(step_label(3, 0), "i");
        assert_eq!(step_label(3, 3), "iv");
        assert_eq!(step_label(3, 8), "ix");
        assert_eq!(step_label(4, 1), "2");
    }

    #[test]
    fn test_parse_setup_command() {
        let setup = parse_setup_command("[student@workstation ~]$ lab start deploy-app").unwrap();
        assert_eq!(setup.command, "lab start deploy-app");
        assert_eq!(setup.lab_name, "deploy-app");
        assert_eq!(setup.profile, None);

        let setup = parse_setup_command("lab start -t rhel9 deploy-app\n").unwrap();
        assert_eq!(setup.lab_name, "deploy-app");
        assert_eq!(setup.profile.as_deref(), Some("rhel9"));

        assert!(parse_setup_command("lab finish deploy-app").is_none());
    }

    #[test]
    fn test_prose_text_wraps_literals() {
        let doc = Html::parse_fragment(
            r#"<p id="p">Create the <code class="filename">site.yml</code>
            file in <span class="filename">~/deploy</span>.</p>"#,
        );
        let p = doc.select(&ID_SELECTOR).next().unwrap();
        assert_eq!(prose_text(p), "Create the `site.yml` file in `~/deploy`.");
    }

    #[test]
    fn test_code_block_marks_typed_text() {
        let doc = Html::parse_fragment(
            r#"<pre id="b">[student@workstation ~]$ <strong class="userinput"><code>ls -l</code></strong>
total 0</pre>"#,
        );
        let pre = doc.select(&ID_SELECTOR).next().unwrap();
        let block = code_block(pre);
        assert!(block.has_typed_input());
        assert_eq!(block.text(), "[student@workstation ~]$ ls -l\ntotal 0");
    }
}
