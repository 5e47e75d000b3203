use std::{
    borrow::Cow,
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Class-index to class-name table of a detection model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Name of `class_id`, or the index itself when the table has no entry.
    pub fn name(&self, class_id: usize) -> Cow<'_, str> {
        match self.names.get(class_id) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(class_id.to_string()),
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Reads one label per line. Lines may carry trailing comma separated
/// fields (such as a display color), only the first field is kept.
pub fn load_labels(filepath: &Path) -> io::Result<ClassNames> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut names = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }
        names.push(label.to_string());
    }

    Ok(ClassNames::new(names))
}

/// Parses the `names` entry Ultralytics writes into exported model metadata,
/// e.g. `{0: 'person', 1: 'helmet'}`. Returns `None` if the value does not
/// have that shape.
pub fn parse_metadata_names(raw: &str) -> Option<ClassNames> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut entries = Vec::new();

    for entry in split_entries(body) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (index, name) = entry.split_once(':')?;
        let index: usize = index.trim().parse().ok()?;
        let name = unquote(name.trim())?;
        entries.push((index, name.to_string()));
    }

    entries.sort_by_key(|(index, _)| *index);
    // Indices must be dense for positional lookup.
    if entries.iter().enumerate().any(|(pos, (index, _))| pos != *index) {
        return None;
    }

    Some(ClassNames::new(
        entries.into_iter().map(|(_, name)| name).collect(),
    ))
}

/// Picks the model's own name table, then the labels file. A labels file that
/// failed to load is logged and leaves an empty table.
pub fn select_class_names(
    metadata_names: Option<ClassNames>,
    labels_file: Option<io::Result<ClassNames>>,
) -> ClassNames {
    if let Some(names) = metadata_names {
        return names;
    }

    match labels_file {
        Some(Ok(names)) => names,
        Some(Err(e)) => {
            tracing::warn!("Failed to load labels file ({}); using class indices", e);
            ClassNames::default()
        }
        None => ClassNames::default(),
    }
}

fn split_entries(body: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if q == c => quote = None,
            (None, ',') => {
                entries.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&body[start..]);
    entries
}

fn unquote(value: &str) -> Option<&str> {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
}
