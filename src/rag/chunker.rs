/// Semantic chunker — splits source files into function/class/method units.
///
/// A per-language pattern table matches declaration lines; block ends are
/// found by brace counting (brace languages) or indentation (Python).
/// Files with no semantic matches fall back to whole-file or fixed-size
/// block chunks. Method chunks may nest inside their class chunk; all
/// other overlaps discard the later match.
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;

// ── Chunk model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    File,
    Class,
    Function,
    Method,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    /// 12-hex digest of "absolute_path:start_line".
    pub id: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub language: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub kind: ChunkKind,
    #[serde(default)]
    pub name: Option<String>,
}

pub fn chunk_id(absolute_path: &str, start_line: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(absolute_path.as_bytes());
    hasher.update(b":");
    hasher.update(start_line.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..6])
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Chunks smaller than this many characters are dropped.
    pub min_chunk_size: usize,
    /// Chunks larger than this are split into sub-chunks.
    pub max_chunk_size: usize,
    /// Overlap between fixed-size sub-chunks, in characters.
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { min_chunk_size: 40, max_chunk_size: 4000, chunk_overlap: 200 }
    }
}

// ── Language table ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockStyle {
    Braces,
    Indent,
}

struct LanguagePattern {
    regex: &'static str,
    kind: ChunkKind,
}

struct LanguageSpec {
    name: &'static str,
    extensions: &'static [&'static str],
    style: BlockStyle,
    /// Ordered: when two patterns match the same start line, the first wins.
    patterns: &'static [LanguagePattern],
}

const LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        name: "rust",
        extensions: &["rs"],
        style: BlockStyle::Braces,
        patterns: &[
            LanguagePattern {
                regex: r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+(\w+)",
                kind: ChunkKind::Function,
            },
            LanguagePattern {
                regex: r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+(\w+)",
                kind: ChunkKind::Class,
            },
            LanguagePattern {
                regex: r"^\s*impl(?:<[^>]*>)?\s+(?:\w+\s+for\s+)?(\w+)",
                kind: ChunkKind::Class,
            },
        ],
    },
    LanguageSpec {
        name: "typescript",
        extensions: &["ts", "tsx", "js", "jsx"],
        style: BlockStyle::Braces,
        patterns: &[
            LanguagePattern {
                regex: r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s+(\w+)",
                kind: ChunkKind::Function,
            },
            LanguagePattern {
                regex: r"^(?:export\s+)?(?:abstract\s+)?class\s+(\w+)",
                kind: ChunkKind::Class,
            },
            LanguagePattern {
                regex: r"^(?:export\s+)?const\s+(\w+)\s*=\s*(?:async\s*)?\([^)]*\)\s*(?::[^=]+)?=>",
                kind: ChunkKind::Function,
            },
            LanguagePattern {
                regex: r"^\s+(?:public\s+|private\s+|protected\s+|static\s+)*(?:async\s+)?(\w+)\s*\([^)]*\)\s*(?::\s*[\w<>\[\], .|]+)?\s*\{",
                kind: ChunkKind::Method,
            },
        ],
    },
    LanguageSpec {
        name: "python",
        extensions: &["py"],
        style: BlockStyle::Indent,
        patterns: &[
            LanguagePattern { regex: r"^(?:async\s+)?def\s+(\w+)", kind: ChunkKind::Function },
            LanguagePattern { regex: r"^class\s+(\w+)", kind: ChunkKind::Class },
            LanguagePattern { regex: r"^\s+(?:async\s+)?def\s+(\w+)", kind: ChunkKind::Method },
        ],
    },
    LanguageSpec {
        name: "go",
        extensions: &["go"],
        style: BlockStyle::Braces,
        patterns: &[
            LanguagePattern {
                regex: r"^func\s+\([^)]+\)\s+(\w+)",
                kind: ChunkKind::Method,
            },
            LanguagePattern { regex: r"^func\s+(\w+)", kind: ChunkKind::Function },
            LanguagePattern { regex: r"^type\s+(\w+)\s+(?:struct|interface)", kind: ChunkKind::Class },
        ],
    },
    LanguageSpec {
        name: "java",
        extensions: &["java"],
        style: BlockStyle::Braces,
        patterns: &[
            LanguagePattern {
                regex: r"^\s*(?:public\s+|private\s+|protected\s+|static\s+|final\s+|abstract\s+)*(?:class|interface|enum)\s+(\w+)",
                kind: ChunkKind::Class,
            },
            LanguagePattern {
                regex: r"^\s+(?:public\s+|private\s+|protected\s+|static\s+|final\s+|synchronized\s+)*[\w<>\[\]]+\s+(\w+)\s*\([^)]*\)\s*(?:throws\s+[\w, ]+)?\s*\{",
                kind: ChunkKind::Method,
            },
        ],
    },
    LanguageSpec {
        name: "c",
        extensions: &["c", "h", "cpp", "cc", "hpp"],
        style: BlockStyle::Braces,
        patterns: &[
            LanguagePattern {
                regex: r"^(?:typedef\s+)?(?:struct|class)\s+(\w+)",
                kind: ChunkKind::Class,
            },
            // Column-0 definitions only; a separator between the return
            // type and the name keeps `if (...)` out.
            LanguagePattern {
                regex: r"^\w[\w\s\*]*[\s\*](\w+)\s*\([^)]*\)\s*\{",
                kind: ChunkKind::Function,
            },
        ],
    },
];

struct CompiledLanguage {
    spec: &'static LanguageSpec,
    patterns: Vec<(Regex, ChunkKind)>,
}

fn compiled_languages() -> &'static Vec<CompiledLanguage> {
    static LANGS: OnceLock<Vec<CompiledLanguage>> = OnceLock::new();
    LANGS.get_or_init(|| {
        LANGUAGES
            .iter()
            .map(|spec| CompiledLanguage {
                spec,
                patterns: spec
                    .patterns
                    .iter()
                    .map(|p| (Regex::new(p.regex).expect("language pattern"), p.kind))
                    .collect(),
            })
            .collect()
    })
}

fn language_for(path: &Path) -> Option<&'static CompiledLanguage> {
    let ext = path.extension()?.to_str()?;
    compiled_languages().iter().find(|l| l.spec.extensions.contains(&ext))
}

pub fn language_name(path: &Path) -> &'static str {
    language_for(path).map(|l| l.spec.name).unwrap_or("text")
}

// ── Chunker ───────────────────────────────────────────────────────────────────

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunk one file's content. Empty files produce zero chunks.
    pub fn chunk_file(&self, absolute_path: &str, relative_path: &str, content: &str) -> Vec<CodeChunk> {
        if content.is_empty() {
            return Vec::new();
        }
        let path = Path::new(absolute_path);
        let language = language_name(path).to_string();

        let semantic = match language_for(path) {
            Some(lang) => self.semantic_chunks(lang, absolute_path, relative_path, &language, content),
            None => Vec::new(),
        };

        if semantic.is_empty() {
            return self.fallback_chunks(absolute_path, relative_path, &language, content);
        }
        semantic
    }

    fn semantic_chunks(
        &self,
        lang: &CompiledLanguage,
        absolute_path: &str,
        relative_path: &str,
        language: &str,
        content: &str,
    ) -> Vec<CodeChunk> {
        let lines: Vec<&str> = content.lines().collect();
        // (start, end, kind) of produced chunks, for overlap discarding
        let mut produced: Vec<(usize, usize, ChunkKind)> = Vec::new();
        let mut chunks: Vec<CodeChunk> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let matched = lang
                .patterns
                .iter()
                .find_map(|(re, kind)| re.captures(line).map(|c| (c, *kind)));
            let Some((caps, kind)) = matched else { continue };

            let start = idx + 1;
            let end = match lang.spec.style {
                BlockStyle::Braces => brace_block_end(&lines, idx),
                BlockStyle::Indent => indent_block_end(&lines, idx),
            };

            // Methods may nest inside a class chunk; everything else that
            // overlaps an existing chunk is discarded.
            let conflict = produced.iter().any(|&(s, e, k)| {
                let overlap = start <= e && s <= end;
                overlap && !(kind == ChunkKind::Method && k == ChunkKind::Class)
            });
            if conflict {
                continue;
            }

            let name = caps.get(1).map(|m| m.as_str().to_string());
            let body = lines[idx..end].join("\n");
            produced.push((start, end, kind));
            chunks.extend(self.emit(absolute_path, relative_path, language, start, end, &body, kind, name));
        }

        chunks.sort_by_key(|c| c.start_line);
        chunks
    }

    /// Emit one chunk, dropping undersized ones and splitting oversized
    /// ones. The first sub-chunk keeps the semantic kind and name; the
    /// rest are blocks.
    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        absolute_path: &str,
        relative_path: &str,
        language: &str,
        start_line: usize,
        end_line: usize,
        body: &str,
        kind: ChunkKind,
        name: Option<String>,
    ) -> Vec<CodeChunk> {
        if body.len() < self.config.min_chunk_size {
            return Vec::new();
        }
        if body.len() <= self.config.max_chunk_size {
            return vec![CodeChunk {
                id: chunk_id(absolute_path, start_line),
                relative_path: relative_path.to_string(),
                absolute_path: absolute_path.to_string(),
                language: language.to_string(),
                start_line,
                end_line,
                content: body.to_string(),
                kind,
                name,
            }];
        }

        // Oversized: split by lines into ≤ max_chunk_size pieces with overlap.
        let mut out = Vec::new();
        let lines: Vec<&str> = body.lines().collect();
        let mut piece_start = 0usize;
        while piece_start < lines.len() {
            let mut size = 0usize;
            let mut piece_end = piece_start;
            while piece_end < lines.len() && size + lines[piece_end].len() + 1 <= self.config.max_chunk_size {
                size += lines[piece_end].len() + 1;
                piece_end += 1;
            }
            if piece_end == piece_start {
                piece_end = piece_start + 1; // single line longer than max
            }

            let abs_start = start_line + piece_start;
            let abs_end = start_line + piece_end - 1;
            let piece_body = lines[piece_start..piece_end].join("\n");
            let first = out.is_empty();
            out.push(CodeChunk {
                id: chunk_id(absolute_path, abs_start),
                relative_path: relative_path.to_string(),
                absolute_path: absolute_path.to_string(),
                language: language.to_string(),
                start_line: abs_start,
                end_line: abs_end,
                content: piece_body,
                kind: if first { kind } else { ChunkKind::Block },
                name: if first { name.clone() } else { None },
            });

            if piece_end >= lines.len() {
                break;
            }
            // Step back far enough to overlap ~chunk_overlap characters.
            let mut overlap = 0usize;
            let mut back = piece_end;
            while back > piece_start + 1 && overlap < self.config.chunk_overlap {
                back -= 1;
                overlap += lines[back].len() + 1;
            }
            piece_start = back;
        }
        out
    }

    /// No semantic match: one whole-file chunk if it fits, fixed-size
    /// blocks with overlap otherwise.
    fn fallback_chunks(
        &self,
        absolute_path: &str,
        relative_path: &str,
        language: &str,
        content: &str,
    ) -> Vec<CodeChunk> {
        if content.len() < self.config.min_chunk_size {
            return Vec::new();
        }
        let total_lines = content.lines().count().max(1);
        if content.len() <= self.config.max_chunk_size {
            return vec![CodeChunk {
                id: chunk_id(absolute_path, 1),
                relative_path: relative_path.to_string(),
                absolute_path: absolute_path.to_string(),
                language: language.to_string(),
                start_line: 1,
                end_line: total_lines,
                content: content.to_string(),
                kind: ChunkKind::File,
                name: None,
            }];
        }
        self.emit(absolute_path, relative_path, language, 1, total_lines, content, ChunkKind::Block, None)
    }
}

// ── Block-end detection ───────────────────────────────────────────────────────

/// End of a brace-delimited block starting at `idx` (0-based). Returns the
/// 1-based line number of the closing brace. A declaration with no opening
/// brace within two lines spans just its own line.
fn brace_block_end(lines: &[&str], idx: usize) -> usize {
    let mut depth = 0i32;
    let mut seen_open = false;
    for (i, line) in lines.iter().enumerate().skip(idx) {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    seen_open = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if seen_open && depth <= 0 {
            return i + 1;
        }
        if !seen_open && i >= idx + 2 {
            return idx + 1;
        }
    }
    lines.len()
}

/// End of an indentation block (Python): the last line before the next
/// non-blank line at or below the declaration's indent.
fn indent_block_end(lines: &[&str], idx: usize) -> usize {
    let decl_indent = indent_of(lines[idx]);
    let mut end = idx + 1;
    for (i, line) in lines.iter().enumerate().skip(idx + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= decl_indent {
            return end;
        }
        end = i + 1;
    }
    end
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(ChunkerConfig { min_chunk_size: 10, max_chunk_size: 4000, chunk_overlap: 100 })
    }

    fn chunk(content: &str, filename: &str) -> Vec<CodeChunk> {
        chunker().chunk_file(&format!("/proj/{filename}"), filename, content)
    }

    #[test]
    fn test_empty_file_produces_zero_chunks() {
        assert!(chunk("", "empty.ts").is_empty());
    }

    #[test]
    fn test_typescript_function_class_method() {
        // Function on lines 10-30, class with method on lines 32-50.
        let mut lines: Vec<String> = Vec::new();
        for _ in 0..9 {
            lines.push("// header".to_string());
        }
        lines.push("export function foo() {".to_string()); // line 10
        for i in 0..19 {
            lines.push(format!("  doWork({i});"));
        }
        lines.push("}".to_string()); // line 30
        lines.push(String::new()); // line 31
        lines.push("class Bar {".to_string()); // line 32
        lines.push("  m() {".to_string()); // line 33
        for i in 0..15 {
            lines.push(format!("    step({i});"));
        }
        lines.push("  }".to_string()); // line 49
        lines.push("}".to_string()); // line 50
        let content = lines.join("\n");

        let chunks = chunk(&content, "sample.ts");
        let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChunkKind::Function, ChunkKind::Class, ChunkKind::Method]);

        assert_eq!(chunks[0].start_line, 10);
        assert_eq!(chunks[0].end_line, 30);
        assert_eq!(chunks[0].name.as_deref(), Some("foo"));
        assert_eq!(chunks[1].start_line, 32);
        assert_eq!(chunks[1].end_line, 50);
        assert_eq!(chunks[1].name.as_deref(), Some("Bar"));
        assert_eq!(chunks[2].start_line, 33);
        assert_eq!(chunks[2].name.as_deref(), Some("m"));

        // Function and class chunks do not overlap.
        assert!(chunks[0].end_line < chunks[1].start_line);
    }

    #[test]
    fn test_rust_fn_and_struct() {
        let content = "\
pub struct Config {
    pub retries: u32,
    pub verbose: bool,
}

pub async fn run(config: &Config) -> Result<(), Error> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        if attempts > config.retries {
            return Ok(());
        }
    }
}
";
        let chunks = chunk(content, "lib.rs");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, ChunkKind::Class);
        assert_eq!(chunks[0].name.as_deref(), Some("Config"));
        assert_eq!(chunks[1].kind, ChunkKind::Function);
        assert_eq!(chunks[1].name.as_deref(), Some("run"));
    }

    #[test]
    fn test_python_indentation_blocks() {
        let content = "\
def top(a, b):
    total = a + b
    return total

class Service:
    def handle(self, request):
        payload = request.body
        return payload

def tail():
    return None
";
        let chunks = chunk(content, "svc.py");
        let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChunkKind::Function, ChunkKind::Class, ChunkKind::Method, ChunkKind::Function]
        );
        let svc = &chunks[1];
        assert_eq!(svc.name.as_deref(), Some("Service"));
        assert_eq!(svc.start_line, 5);
        assert_eq!(svc.end_line, 8);
    }

    #[test]
    fn test_go_method_receiver() {
        let content = "\
func (s *Server) Handle(w http.ResponseWriter, r *http.Request) {
    s.mu.Lock()
    defer s.mu.Unlock()
}

func main() {
    run()
}
";
        let chunks = chunk(content, "main.go");
        assert_eq!(chunks[0].kind, ChunkKind::Method);
        assert_eq!(chunks[0].name.as_deref(), Some("Handle"));
        assert_eq!(chunks[1].kind, ChunkKind::Function);
        assert_eq!(chunks[1].name.as_deref(), Some("main"));
    }

    #[test]
    fn test_java_class_and_method() {
        let content = "\
public class TokenService {
    private final Clock clock;

    public String issueToken(String subject) {
        return sign(subject, clock.now());
    }
}
";
        let chunks = chunk(content, "TokenService.java");
        assert_eq!(chunks[0].kind, ChunkKind::Class);
        assert_eq!(chunks[0].name.as_deref(), Some("TokenService"));
        assert_eq!(chunks[1].kind, ChunkKind::Method);
        assert_eq!(chunks[1].name.as_deref(), Some("issueToken"));
    }

    #[test]
    fn test_c_functions_skip_control_flow() {
        let content = "\
struct config {
    int retries;
};

int main(int argc, char **argv) {
    if (argc > 1) {
        return run(argv[1]);
    }
    return 0;
}
";
        let chunks = chunk(content, "main.c");
        let names: Vec<&str> = chunks.iter().filter_map(|c| c.name.as_deref()).collect();
        assert_eq!(names, vec!["config", "main"]);
        assert_eq!(chunks[1].kind, ChunkKind::Function);
    }

    #[test]
    fn test_no_semantic_match_falls_back_to_file_chunk() {
        let content = "just some notes\nwithout any code structure\nat all\n";
        let chunks = chunk(content, "notes.txt");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::File);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn test_exactly_max_size_is_one_chunk() {
        let config = ChunkerConfig { min_chunk_size: 10, max_chunk_size: 100, chunk_overlap: 20 };
        let c = Chunker::new(config);
        let content = "x".repeat(100);
        let chunks = c.chunk_file("/proj/data.txt", "data.txt", &content);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::File);
    }

    #[test]
    fn test_oversized_file_splits_into_blocks() {
        let config = ChunkerConfig { min_chunk_size: 10, max_chunk_size: 200, chunk_overlap: 40 };
        let c = Chunker::new(config);
        let content = (0..60).map(|i| format!("line number {i}")).collect::<Vec<_>>().join("\n");
        let chunks = c.chunk_file("/proj/big.txt", "big.txt", &content);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|ch| ch.content.len() <= 200));
        // Consecutive sub-chunks overlap.
        assert!(chunks[1].start_line <= chunks[0].end_line);
    }

    #[test]
    fn test_oversized_semantic_chunk_keeps_name_on_first_piece() {
        let config = ChunkerConfig { min_chunk_size: 10, max_chunk_size: 300, chunk_overlap: 50 };
        let c = Chunker::new(config);
        let mut lines = vec!["export function huge() {".to_string()];
        for i in 0..40 {
            lines.push(format!("  compute(step_{i});"));
        }
        lines.push("}".to_string());
        let chunks = c.chunk_file("/proj/huge.ts", "huge.ts", &lines.join("\n"));
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].kind, ChunkKind::Function);
        assert_eq!(chunks[0].name.as_deref(), Some("huge"));
        assert!(chunks[1..].iter().all(|ch| ch.kind == ChunkKind::Block && ch.name.is_none()));
    }

    #[test]
    fn test_tiny_chunks_dropped() {
        let config = ChunkerConfig { min_chunk_size: 200, max_chunk_size: 4000, chunk_overlap: 50 };
        let c = Chunker::new(config);
        let chunks = c.chunk_file("/p/s.rs", "s.rs", "fn tiny() {}\n");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_chunk_id_is_stable_12_hex() {
        let a = chunk_id("/proj/a.rs", 10);
        let b = chunk_id("/proj/a.rs", 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, chunk_id("/proj/a.rs", 11));
    }
}
