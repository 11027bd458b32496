//! Source file chunking.
//!
//! Two strategies, selected per file extension:
//!
//! - **Syntax-aware**: tree-sitter parses the file and chunks are emitted
//!   along declaration boundaries (functions, classes, impls, ...).
//!   Declarations larger than [`MAX_CHUNK_CHARS`] are subdivided at
//!   statement boundaries. Runs of top-level statements between
//!   declarations are grouped into their own chunks.
//! - **Character window**: a sliding window of [`WINDOW_CHARS`] characters
//!   with [`OVERLAP_CHARS`] overlap, aligned to line boundaries. Used when
//!   the extension is not recognized or parsing fails.
//!
//! Chunk line ranges are 1-based inclusive and chunk content always equals
//! the file substring covered by those lines, so stored chunks can be
//! mapped back onto the file exactly.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;
use tree_sitter::{Language, Node, Parser};

/// Hard ceiling on chunk size; larger declarations are subdivided.
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Window size for the character fallback.
pub const WINDOW_CHARS: usize = 2000;

/// Overlap between consecutive fallback windows.
pub const OVERLAP_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("failed to load grammar for {language}: {source}")]
    Grammar {
        language: &'static str,
        source: tree_sitter::LanguageError,
    },
}

/// What a chunk is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Function,
    Method,
    Struct,
    Enum,
    Trait,
    Impl,
    Const,
    Module,
    Class,
    Interface,
    /// A run of top-level statements between declarations.
    Statements,
    /// A character-window fallback slice.
    Window,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Trait => "trait",
            Self::Impl => "impl",
            Self::Const => "const",
            Self::Module => "module",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Statements => "statements",
            Self::Window => "window",
        }
    }
}

/// One chunk of a single file.
#[derive(Debug, Clone)]
pub struct SourceChunk {
    pub content: String,
    /// 1-based, inclusive.
    pub start_line: u32,
    /// 1-based, inclusive.
    pub end_line: u32,
    pub kind: ChunkKind,
}

/// Splits file text into chunks. Holds one parser per supported language;
/// parsing needs `&mut`, so the controller owns the chunker exclusively
/// for the duration of a run.
pub struct Chunker {
    parsers: HashMap<&'static str, Parser>,
}

impl Chunker {
    pub fn new() -> Result<Self, ChunkerError> {
        let grammars: [(&'static str, Language); 5] = [
            ("rust", tree_sitter_rust::LANGUAGE.into()),
            ("python", tree_sitter_python::LANGUAGE.into()),
            ("javascript", tree_sitter_javascript::LANGUAGE.into()),
            ("typescript", tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            ("go", tree_sitter_go::LANGUAGE.into()),
        ];

        let mut parsers = HashMap::new();
        for (name, language) in grammars {
            let mut parser = Parser::new();
            parser
                .set_language(&language)
                .map_err(|source| ChunkerError::Grammar {
                    language: name,
                    source,
                })?;
            parsers.insert(name, parser);
        }
        Ok(Self { parsers })
    }

    /// Language name for a file extension, if the syntax-aware strategy
    /// supports it.
    pub fn language_for_extension(extension: &str) -> Option<&'static str> {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "rs" => Some("rust"),
            "py" => Some("python"),
            "js" | "jsx" => Some("javascript"),
            "ts" | "tsx" => Some("typescript"),
            "go" => Some("go"),
            _ => None,
        }
    }

    /// Chunk one file's text. Never fails: unparseable input falls back to
    /// the character window strategy; empty and whitespace-only input
    /// yields no chunks.
    pub fn chunk(&mut self, source: &str, extension: &str) -> Vec<SourceChunk> {
        if source.trim().is_empty() {
            return Vec::new();
        }

        if let Some(language) = Self::language_for_extension(extension) {
            if let Some(chunks) = self.ast_chunks(source, language) {
                return chunks;
            }
            debug!(language, "parse failed, using window fallback");
        }

        window_chunks(source)
    }

    fn ast_chunks(&mut self, source: &str, language: &'static str) -> Option<Vec<SourceChunk>> {
        let parser = self.parsers.get_mut(language)?;
        let tree = parser.parse(source, None)?;

        let layout = LineLayout::new(source);
        let mut spans = Vec::new();
        collect_pieces(tree.root_node(), &layout, false, &mut spans);

        spans.sort_by_key(|s| (s.start, s.end));
        apply_same_line_tiebreak(&mut spans);

        // A parsed file with nothing but comments/whitespace ends up with
        // no spans at all, and so no chunks.
        let chunks: Vec<SourceChunk> = spans
            .into_iter()
            .filter_map(|span| {
                let content = layout.slice(span.start, span.end);
                if content.trim().is_empty() {
                    return None;
                }
                Some(SourceChunk {
                    content,
                    start_line: span.start as u32 + 1,
                    end_line: span.end as u32 + 1,
                    kind: span.kind,
                })
            })
            .collect();

        Some(chunks)
    }
}

/// A candidate chunk as 0-based inclusive line span.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    kind: ChunkKind,
}

/// Line bookkeeping for one file: per-line text and byte offsets, so span
/// sizes and slices are O(1)/O(span).
struct LineLayout<'a> {
    lines: Vec<&'a str>,
    /// Byte offset of each line start, plus a trailing sentinel.
    offsets: Vec<usize>,
}

impl<'a> LineLayout<'a> {
    fn new(source: &'a str) -> Self {
        let lines: Vec<&str> = source.lines().collect();
        let mut offsets = Vec::with_capacity(lines.len() + 1);
        offsets.push(0);
        for (i, byte) in source.bytes().enumerate() {
            // A newline starts a new line unless it terminates the file.
            if byte == b'\n' && i + 1 < source.len() {
                offsets.push(i + 1);
            }
        }
        offsets.truncate(lines.len().max(1));
        offsets.push(source.len());
        Self { lines, offsets }
    }

    fn span_chars(&self, start: usize, end: usize) -> usize {
        let hi = (end + 1).min(self.offsets.len() - 1);
        self.offsets[hi].saturating_sub(self.offsets[start])
    }

    fn slice(&self, start: usize, end: usize) -> String {
        let end = end.min(self.lines.len().saturating_sub(1));
        self.lines[start..=end].join("\n")
    }

    fn last_line(&self) -> usize {
        self.lines.len().saturating_sub(1)
    }
}

/// 0-based inclusive line span of a node. tree-sitter reports a node that
/// ends on a newline as ending at column 0 of the next row; pull that back.
fn node_lines(node: Node) -> (usize, usize) {
    let start = node.start_position().row;
    let end_pos = node.end_position();
    let mut end = end_pos.row;
    if end > start && end_pos.column == 0 {
        end -= 1;
    }
    (start, end)
}

fn declaration_kind(node_kind: &str, in_container: bool) -> Option<ChunkKind> {
    let function = if in_container {
        ChunkKind::Method
    } else {
        ChunkKind::Function
    };
    match node_kind {
        // Rust
        "function_item" => Some(function),
        "struct_item" => Some(ChunkKind::Struct),
        "enum_item" => Some(ChunkKind::Enum),
        "trait_item" => Some(ChunkKind::Trait),
        "impl_item" => Some(ChunkKind::Impl),
        "const_item" | "static_item" => Some(ChunkKind::Const),
        "mod_item" => Some(ChunkKind::Module),

        // Python
        "function_definition" | "decorated_definition" => Some(function),
        "class_definition" => Some(ChunkKind::Class),

        // JavaScript / TypeScript
        "function_declaration" | "generator_function_declaration" => Some(function),
        "class_declaration" | "abstract_class_declaration" => Some(ChunkKind::Class),
        "method_definition" => Some(ChunkKind::Method),
        "interface_declaration" => Some(ChunkKind::Interface),
        "enum_declaration" => Some(ChunkKind::Enum),

        // Go
        "method_declaration" => Some(ChunkKind::Method),
        "type_declaration" => Some(ChunkKind::Struct),
        "const_declaration" => Some(ChunkKind::Const),

        _ => None,
    }
}

fn is_comment(node_kind: &str) -> bool {
    node_kind.contains("comment")
}

fn is_container(kind: ChunkKind) -> bool {
    matches!(kind, ChunkKind::Impl | ChunkKind::Class | ChunkKind::Module)
}

/// Walk the named children of `node`, emitting declaration spans and
/// grouping everything else into statement runs.
fn collect_pieces(node: Node, layout: &LineLayout, in_container: bool, out: &mut Vec<Span>) {
    let mut run: Option<(usize, usize)> = None;

    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();
    drop(cursor);

    for child in children {
        if is_comment(child.kind()) {
            continue;
        }

        let (child_start, child_end) = node_lines(child);

        if let Some(kind) = declaration_kind(child.kind(), in_container) {
            flush_run(&mut run, layout, out);
            emit_declaration(child, kind, layout, out);
            continue;
        }

        let child_chars = layout.span_chars(child_start, child_end);
        if child_chars > MAX_CHUNK_CHARS && child.named_child_count() > 0 {
            // Oversized non-declaration node (a block, a declaration list):
            // descend so inner declarations still become their own chunks.
            flush_run(&mut run, layout, out);
            collect_pieces(child, layout, in_container, out);
            continue;
        }

        // Extend the current statement run, flushing when it would grow
        // past the ceiling.
        run = match run {
            None => Some((child_start, child_end)),
            Some((start, end)) if layout.span_chars(start, child_end) > MAX_CHUNK_CHARS => {
                emit_run(start, end, layout, out);
                Some((child_start, child_end))
            }
            Some((start, _)) => Some((start, child_end)),
        };
    }

    flush_run(&mut run, layout, out);
}

fn flush_run(run: &mut Option<(usize, usize)>, layout: &LineLayout, out: &mut Vec<Span>) {
    if let Some((start, end)) = run.take() {
        emit_run(start, end, layout, out);
    }
}

/// Emit a statement run, splitting it at line boundaries when oversize.
fn emit_run(start: usize, end: usize, layout: &LineLayout, out: &mut Vec<Span>) {
    if layout.span_chars(start, end) <= MAX_CHUNK_CHARS {
        out.push(Span {
            start,
            end,
            kind: ChunkKind::Statements,
        });
        return;
    }

    let mut piece_start = start;
    let mut line = start;
    while line <= end {
        if line > piece_start && layout.span_chars(piece_start, line) > MAX_CHUNK_CHARS {
            out.push(Span {
                start: piece_start,
                end: line - 1,
                kind: ChunkKind::Statements,
            });
            piece_start = line;
        }
        line += 1;
    }
    out.push(Span {
        start: piece_start,
        end,
        kind: ChunkKind::Statements,
    });
}

fn emit_declaration(node: Node, kind: ChunkKind, layout: &LineLayout, out: &mut Vec<Span>) {
    let (start, end) = node_lines(node);
    if layout.span_chars(start, end) <= MAX_CHUNK_CHARS {
        out.push(Span { start, end, kind });
        return;
    }
    // Subdivide at statement boundaries; inside impls/classes the nested
    // functions come out as methods.
    collect_pieces(node, layout, is_container(kind), out);
}

/// When one chunk starts on the line the previous one ends on, pull the
/// previous end back so line ranges do not overlap.
fn apply_same_line_tiebreak(spans: &mut [Span]) {
    for i in 1..spans.len() {
        let current_start = spans[i].start;
        let prev = &mut spans[i - 1];
        if prev.end == current_start && prev.start < prev.end {
            prev.end -= 1;
        }
    }
}

/// Character-window fallback: fixed-size windows aligned to line
/// boundaries where possible, overlapping by [`OVERLAP_CHARS`].
fn window_chunks(source: &str) -> Vec<SourceChunk> {
    let layout = LineLayout::new(source);
    let len = source.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len {
        let mut end = (start + WINDOW_CHARS).min(len);
        while end > start && !source.is_char_boundary(end) {
            end -= 1;
        }

        if end < len {
            // Align the cut to the last newline inside the window.
            if let Some(nl) = source[start..end].rfind('\n') {
                end = start + nl + 1;
            }
        }

        let raw = &source[start..end];
        let content = raw.strip_suffix('\n').unwrap_or(raw);
        if !content.trim().is_empty() {
            let start_line = line_of(&layout, start);
            let end_line = line_of(&layout, start + content.len().saturating_sub(1));
            chunks.push(SourceChunk {
                content: content.to_string(),
                start_line: start_line as u32 + 1,
                end_line: end_line as u32 + 1,
                kind: ChunkKind::Window,
            });
        }

        if end >= len {
            break;
        }

        let target = end.saturating_sub(OVERLAP_CHARS);
        let mut next = layout
            .offsets
            .iter()
            .take(layout.lines.len())
            .rev()
            .find(|&&off| off <= target)
            .copied()
            .unwrap_or(end);
        if next <= start {
            next = end;
        }
        start = next;
    }

    chunks
}

fn line_of(layout: &LineLayout, offset: usize) -> usize {
    match layout.offsets[..layout.lines.len()].binary_search(&offset) {
        Ok(line) => line,
        Err(insert) => insert.saturating_sub(1).min(layout.last_line()),
    }
}
