//! Test document parsing
//!
//! A test document is UTF-8 text made of fragments separated by the YAML
//! document separator (`---` on its own line). Fragment contents are
//! opaque at split time; decoding classifies each fragment as either a
//! Kubernetes object or a policy module.

use kube::api::DynamicObject;

use crate::error::Error;
use crate::policy::Module;
use crate::Result;

/// The lines that bound a fragment within its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    /// First line of the fragment, 1-based.
    pub start: usize,
    /// Last line of the fragment, 1-based. Separator lines are excluded.
    pub end: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// The decoded content type of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentKind {
    /// Not decoded yet, or decodes to nothing useful.
    #[default]
    Unknown,
    /// The fragment could not be parsed.
    Invalid,
    /// The fragment contains a Kubernetes object.
    Object,
    /// The fragment contains a policy module.
    Module,
}

impl std::fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FragmentKind::Object => "Kubernetes",
            FragmentKind::Module => "Rego",
            FragmentKind::Invalid => "invalid",
            FragmentKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// A parseable portion of a document.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    source: String,
    location: Location,
    kind: FragmentKind,

    object: Option<DynamicObject>,
    module: Option<Module>,
}

impl Fragment {
    fn new(source: String, location: Location) -> Self {
        Fragment {
            source,
            location,
            ..Default::default()
        }
    }

    /// The raw fragment text, as split from the document.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Where the fragment sits in the document.
    pub fn location(&self) -> Location {
        self.location
    }

    /// The decoded content type.
    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    /// The Kubernetes object, if the fragment decoded to one.
    pub fn object(&self) -> Option<&DynamicObject> {
        self.object.as_ref()
    }

    /// The policy module, if the fragment decoded to one.
    pub fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }

    /// Whether this fragment has already decoded to a known type.
    pub fn is_decoded(&self) -> bool {
        !matches!(self.kind, FragmentKind::Unknown | FragmentKind::Invalid)
    }

    /// Attempt to parse the fragment. Decoding is idempotent; the byte
    /// image is retained either way.
    pub fn decode(&mut self) -> Result<FragmentKind> {
        if self.is_decoded() {
            return Ok(self.kind);
        }

        // YAML first. A fragment is an object only when it decodes to a
        // mapping carrying both apiVersion and kind.
        if let Ok(value) = crate::yaml::parse_value(&self.source) {
            if value.is_object() {
                if has_kind_version(&value) {
                    let object: DynamicObject = serde_json::from_value(value).map_err(|e| {
                        Error::InvalidObject(format!(
                            "lines {}: failed to decode object: {e}",
                            self.location
                        ))
                    })?;

                    self.kind = FragmentKind::Object;
                    self.object = Some(object);
                    return Ok(self.kind);
                }

                return Err(Error::InvalidObject(format!(
                    "lines {}: YAML fragment is not a Kubernetes object",
                    self.location
                )));
            }
        }

        // Not YAML, so assume the author meant Rego. The assumption
        // matters for error reporting: syntax errors in checks must reach
        // the user rather than being classified away.
        let module = Module::parse_check_fragment(&self.source).map_err(|e| {
            Error::bad_input(format!("lines {}: invalid policy fragment: {e}", self.location))
        })?;

        // Rego parses bare scalars happily, but a module with no rules
        // can't check anything.
        if !module.has_rules() {
            return Ok(FragmentKind::Unknown);
        }

        self.kind = FragmentKind::Module;
        self.module = Some(module);
        Ok(self.kind)
    }
}

fn has_kind_version(value: &serde_json::Value) -> bool {
    let non_empty = |key: &str| {
        value
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    };

    non_empty("apiVersion") && non_empty("kind")
}

/// An ordered collection of fragments read from one file.
#[derive(Debug, Clone, Default)]
pub struct Document {
    name: String,
    fragments: Vec<Fragment>,
}

impl Document {
    /// The file path this document was read from, if any.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fragments in document order.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Mutable access for decoding fragments in place.
    pub fn fragments_mut(&mut self) -> &mut [Fragment] {
        &mut self.fragments
    }
}

/// True for lines that match the YAML document separator: `---` followed
/// only by blanks.
fn is_separator(line: &str) -> bool {
    match line.strip_prefix("---") {
        Some(rest) => rest.chars().all(|c| matches!(c, ' ' | '\t' | '\x0c' | '\r')),
        None => false,
    }
}

/// Split input text into fragments. Fragment contents are opaque and need
/// not be YAML. Empty fragments are discarded, which keeps the line
/// accounting exact since separators never belong to a fragment.
pub fn read_document(input: &str) -> Document {
    let mut doc = Document::default();
    let mut buf = String::new();
    let mut start_line = 0;
    let mut current_line = 0;

    for line in input.lines() {
        current_line += 1;
        if start_line == 0 {
            start_line = current_line;
        }

        // Another line read, so restore the newline separator.
        if !buf.is_empty() {
            buf.push('\n');
        }

        if is_separator(line) {
            if !buf.is_empty() {
                doc.fragments.push(Fragment::new(
                    std::mem::take(&mut buf),
                    Location {
                        start: start_line,
                        end: current_line - 1,
                    },
                ));
            }

            start_line = 0;
            buf.clear();
            continue;
        }

        buf.push_str(line);
    }

    // Anything between the last separator and EOF.
    if !buf.is_empty() {
        doc.fragments.push(Fragment::new(
            buf,
            Location {
                start: start_line,
                end: current_line,
            },
        ));
    }

    doc
}

/// Read a document from the given file path.
pub fn read_file(path: &std::path::Path) -> Result<Document> {
    let input = std::fs::read_to_string(path)?;
    let mut doc = read_document(&input);
    doc.name = path.to_string_lossy().into_owned();
    Ok(doc)
}
