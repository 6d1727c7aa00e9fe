//! Token-budgeted prompt pack: two passes over the same spooled tar.gz.
//!
//! Pass 1 scans the archive into rendered markdown sections (summary,
//! tree, dependencies, environment variables, prompt library) and collects
//! excerpt candidates. Pass 2 extracts file heads and packs them into the
//! main document while they fit, spilling the rest into overlap-linked
//! chunk files. Everything ships as one ZIP.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Cursor, Read, Seek, Write};
use std::sync::LazyLock;

use chrono::Utc;
use flate2::read::GzDecoder;
use regex::Regex;
use tar::Archive;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{read_capped, read_sample, strip_first_dir, ExporterError, TEXT_SAMPLE_BYTES};
use crate::matcher::{glob_to_regex, is_binary_sample, normalize_rel, PathFilter};
use crate::secrets::Scanner;
use crate::tokens::{count_for_parts, count_tokens, ModelRegistry, Planner};
use crate::types::{PromptProfile, SecretStrategy};

#[derive(Debug, Clone)]
pub struct PromptPackOptions {
    pub owner: String,
    pub repo: String,
    pub reference: String,
    pub profile: PromptProfile,
    pub model_id: String,
    /// Directory tree rendering depth. Zero means the default (3).
    pub tree_depth: usize,
    /// Children shown per directory before `… + N more`. Zero means 10.
    pub limit_per_dir: usize,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    /// Excerpt head size in lines. Zero means the per-profile default
    /// (200 for short/rag, 400 for full).
    pub max_lines_per_file: usize,
    pub mask_secrets: bool,
    /// Override the model/profile token budget when non-zero.
    pub token_budget: u32,
    /// Reserve percentage when `token_budget` overrides. Zero means 10.
    pub reserve_pct: u32,
    /// Chunk overlap in tokens. Zero means 150.
    pub overlap_tokens: u32,
}

impl Default for PromptPackOptions {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            reference: String::new(),
            profile: PromptProfile::Short,
            model_id: String::new(),
            tree_depth: 0,
            limit_per_dir: 0,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            max_lines_per_file: 0,
            mask_secrets: false,
            token_budget: 0,
            reserve_pct: 0,
            overlap_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dep {
    name: String,
    version: String,
    source: String,
}

#[derive(Debug, Default, Clone)]
struct EnvVar {
    sources: Vec<String>,
    usages: Vec<String>,
    is_secret: bool,
}

#[derive(Debug, Clone)]
struct ExcerptRef {
    path: String,
    priority: u32,
}

/// Result of pass 1: rendered sections plus the excerpt plan.
pub struct PromptPackScan {
    profile: PromptProfile,
    model_id: String,
    max_lines_per_file: usize,
    mask_secrets: bool,
    usable_tokens: u32,
    overlap_tokens: u32,
    main_max_tokens: u32,
    sections: String,
    candidates: Vec<ExcerptRef>,
}

/// Counters reported after pass 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptPackStats {
    pub main_tokens: u32,
    pub excerpts_in_main: usize,
    pub chunk_files: usize,
    pub masked_lines: usize,
}

static RE_ENV_GO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"os\.Getenv\(\s*"([A-Z0-9_]+)"\s*\)"#).expect("env regex"));
static RE_ENV_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"process\.env\.([A-Z0-9_]+)").expect("env regex"));
static RE_ENV_VITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"import\.meta\.env\.([A-Z0-9_]+)").expect("env regex"));
static RE_ENV_PY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"os\.getenv\(\s*['"]([A-Z0-9_]+)['"]\s*\)"#).expect("env regex"));
static RE_ENV_DOTNET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Environment\.GetEnvironmentVariable\(\s*"(.*?)"\s*\)"#).expect("env regex")
});
static RE_ENV_COMPOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*-?\s*([A-Z0-9_]+)\s*=\s*[^#\s]+").expect("env regex"));

static RE_CSPROJ_PKG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"PackageReference\s+Include="([^"]+)"\s+Version="([^"]+)""#).expect("csproj regex")
});
static RE_CSPROJ_TF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<TargetFramework(?:s?)>([^<]+)</TargetFramework(?:s?)>").expect("csproj regex")
});
static RE_PY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*name\s*=\s*["']([^"']+)["']"#).expect("pyproject regex"));
static RE_PY_VER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*version\s*=\s*["']([^"']+)["']"#).expect("pyproject regex")
});

/// Priority-ranked glob table selecting excerpt candidates.
static EXCERPT_GLOBS: &[(&str, u32)] = &[
    ("README*", 1),
    ("cmd/**/main.go", 1),
    ("internal/server/**", 2),
    ("apps/**/app/**", 2),
    ("pages/**", 2),
    ("next.config.*", 2),
    ("Program.cs", 1),
    ("Startup.cs", 1),
    ("Controllers/**", 2),
    ("Makefile", 2),
    ("Dockerfile*", 2),
    ("docker-compose*.yml", 2),
    ("k8s/**", 3),
    ("internal/**", 3),
    ("src/**", 3),
    ("package.json", 1),
    ("go.mod", 1),
    ("*.csproj", 1),
    ("pyproject.toml", 1),
    ("requirements.txt", 1),
];

static EXCERPT_FILTERS: LazyLock<Vec<(Regex, u32)>> = LazyLock::new(|| {
    EXCERPT_GLOBS
        .iter()
        .map(|(glob, prio)| (glob_to_regex(glob), *prio))
        .collect()
});

struct ScanState {
    dir_children: BTreeMap<String, Vec<String>>,
    readme_lines: Vec<String>,
    deps: Vec<Dep>,
    env: BTreeMap<String, EnvVar>,
    candidates: Vec<ExcerptRef>,
}

/// Pass 1: scan the archive and render the fixed sections.
pub fn scan_tar_gz<R: Read>(
    src: R,
    opts: &PromptPackOptions,
) -> Result<PromptPackScan, ExporterError> {
    let max_lines = if opts.max_lines_per_file > 0 {
        opts.max_lines_per_file
    } else {
        match opts.profile {
            PromptProfile::Full => 400,
            PromptProfile::Short | PromptProfile::Rag => 200,
        }
    };
    let tree_depth = if opts.tree_depth > 0 { opts.tree_depth } else { 3 };
    let limit_per_dir = if opts.limit_per_dir > 0 {
        opts.limit_per_dir
    } else {
        10
    };
    let overlap_tokens = if opts.overlap_tokens > 0 {
        opts.overlap_tokens
    } else {
        150
    };

    let planner = Planner::new(ModelRegistry::with_defaults());
    let budget = if opts.token_budget > 0 {
        let total = opts.token_budget;
        let pct = if opts.reserve_pct > 0 { opts.reserve_pct } else { 10 };
        let reserve = total * pct / 100;
        crate::tokens::Budget {
            total,
            reserve,
            usable: total - reserve,
        }
    } else {
        planner.budget(opts.profile.as_str(), &opts.model_id)
    };

    let filter = PathFilter::new(&opts.include_globs, &opts.exclude_globs);
    let mut state = ScanState {
        dir_children: BTreeMap::new(),
        readme_lines: Vec::new(),
        deps: Vec::new(),
        env: BTreeMap::new(),
        candidates: Vec::new(),
    };

    let mut archive = Archive::new(GzDecoder::new(src));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(name) = strip_first_dir(&raw) else {
            continue;
        };
        let Ok(rel) = normalize_rel(name) else {
            continue;
        };
        if !filter.matches_normalized(&rel) {
            continue;
        }

        state.add_to_tree(&rel);

        let size = entry.size();
        let want = TEXT_SAMPLE_BYTES.min(size as usize);
        let sample = read_sample(&mut entry, want)?;
        if sample.len() < want {
            continue;
        }
        if is_binary_sample(&sample) {
            continue;
        }

        let lower = rel.to_ascii_lowercase();
        let base = lower.rsplit('/').next().unwrap_or(&lower).to_string();
        let mut reader = Cursor::new(sample).chain(&mut entry);

        if is_readme(&base) {
            let lines = read_first_nonempty_lines(&mut reader, 30);
            state.readme_lines = lines.into_iter().take(3).collect();
        } else if base == "package.json" {
            let content = read_capped(&mut reader, 512 * 1024);
            state.parse_npm(&content);
        } else if base == "go.mod" {
            let content = read_capped(&mut reader, 256 * 1024);
            state.parse_go_mod(&content);
        } else if base.ends_with(".csproj") {
            let content = read_capped(&mut reader, 512 * 1024);
            state.parse_csproj(&content);
        } else if base == "pyproject.toml" || base == "requirements.txt" {
            let content = read_capped(&mut reader, 512 * 1024);
            state.parse_python_deps(&base, &content);
        } else if base.starts_with("docker-compose")
            && (base.ends_with(".yml") || base.ends_with(".yaml"))
        {
            let content = read_capped(&mut reader, 512 * 1024);
            for name in grep_env_from_compose(&content) {
                state.add_env(&name, "compose", "");
            }
        } else if base.starts_with(".env") {
            let content = read_capped(&mut reader, 256 * 1024);
            for name in grep_env_from_dotenv(&content) {
                state.add_env(&name, ".env", "");
            }
        } else {
            let content = read_capped(&mut reader, 512 * 1024);
            let usage = format!("{rel}:");
            for re in [
                &*RE_ENV_GO,
                &*RE_ENV_NODE,
                &*RE_ENV_VITE,
                &*RE_ENV_PY,
                &*RE_ENV_DOTNET,
            ] {
                for cap in re.captures_iter(&content) {
                    if let Some(name) = cap.get(1) {
                        state.add_env(name.as_str(), "code", &usage);
                    }
                }
            }
        }

        for (re, priority) in EXCERPT_FILTERS.iter() {
            if re.is_match(&rel) {
                state.candidates.push(ExcerptRef {
                    path: rel.clone(),
                    priority: *priority,
                });
                break;
            }
        }
    }

    state
        .candidates
        .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.path.cmp(&b.path)));
    state.deps.sort_by(|a, b| a.name.cmp(&b.name));

    // Render the fixed sections.
    let summary = render_summary(opts, &state, budget.total, budget.reserve);
    let tree = render_tree(&state, tree_depth, limit_per_dir);
    let deps = render_deps(&state);
    let env = render_env(&state);
    let prompts = render_prompts();
    let sections = format!("{summary}{tree}{deps}{env}{prompts}");

    let pre_tokens = count_for_parts(&[&summary, &tree, &deps, &env, &prompts], &opts.model_id);
    let main_max_tokens = budget.usable.saturating_sub(pre_tokens).max(1000);

    Ok(PromptPackScan {
        profile: opts.profile,
        model_id: opts.model_id.clone(),
        max_lines_per_file: max_lines,
        mask_secrets: opts.mask_secrets,
        usable_tokens: budget.usable,
        overlap_tokens,
        main_max_tokens,
        sections,
        candidates: state.candidates,
    })
}

struct Chunk {
    body: String,
    used_tokens: u32,
    files: Vec<(String, usize)>,
}

impl PromptPackScan {
    /// Pass 2: re-read the archive, extract candidate heads, pack the main
    /// document and chunk files and write the ZIP container.
    pub fn write_zip<R: Read, W: Write + Seek>(
        self,
        src: R,
        dst: W,
    ) -> Result<PromptPackStats, ExporterError> {
        let wanted: HashSet<&str> = self.candidates.iter().map(|c| c.path.as_str()).collect();
        let mut heads: HashMap<String, (String, usize)> = HashMap::new();

        let mut archive = Archive::new(GzDecoder::new(src));
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let Some(name) = strip_first_dir(&raw) else {
                continue;
            };
            let Ok(rel) = normalize_rel(name) else {
                continue;
            };
            if !wanted.contains(rel.as_str()) || heads.contains_key(&rel) {
                continue;
            }
            let (head, lines) = extract_head(&mut entry, self.max_lines_per_file);
            heads.insert(rel, (head, lines));
        }

        let mut scanner = self
            .mask_secrets
            .then(|| Scanner::new(SecretStrategy::Redacted));
        let mut stats = PromptPackStats::default();

        let mut main = String::new();
        main.push_str(&self.sections);
        let mut main_used = count_tokens(&self.sections, &self.model_id);
        main.push_str("## 06_EXCERPTS\n\n");
        main_used += count_tokens("## 06_EXCERPTS\n\n", &self.model_id);

        let mut chunks: Vec<Chunk> = Vec::new();

        for candidate in &self.candidates {
            let Some((head, lines)) = heads.get(candidate.path.as_str()) else {
                continue;
            };
            let mut segment = head.clone();
            let mut block_masked = 0usize;
            if let Some(scanner) = scanner.as_mut() {
                let mut masked = String::with_capacity(segment.len());
                for (i, line) in segment.lines().enumerate() {
                    let (out, changed) = scanner.mask_line(&candidate.path, line, i + 1);
                    if changed {
                        block_masked += 1;
                    }
                    masked.push_str(&out);
                    if !out.ends_with('\n') {
                        masked.push('\n');
                    }
                }
                segment = masked;
            }
            stats.masked_lines += block_masked;

            let lang = code_lang_by_ext(&candidate.path);
            let mut block = format!(
                "### FILE: {} (first {} lines)\n```{}\n{}```\n\n",
                candidate.path, lines, lang, segment
            );
            if block_masked > 0 {
                block.push_str("_secrets masked_\n\n");
            }
            let block_tokens = count_tokens(&block, &self.model_id);

            if main_used + block_tokens <= self.main_max_tokens {
                main.push_str(&block);
                main_used += block_tokens;
                stats.excerpts_in_main += 1;
                continue;
            }

            let need_new = match chunks.last() {
                None => true,
                Some(cur) => {
                    cur.used_tokens > 0
                        && cur.used_tokens + block_tokens + self.overlap_tokens
                            > self.usable_tokens
                }
            };
            if need_new {
                let overlap_quote = chunks
                    .last()
                    .map(|prev| last_n_chars(&prev.body, (self.overlap_tokens as usize) * 4));
                let mut chunk = Chunk {
                    body: String::new(),
                    used_tokens: 0,
                    files: Vec::new(),
                };
                if let Some(quote) = overlap_quote {
                    if !quote.is_empty() {
                        chunk.body.push_str("> Overlap (previous):\n>\n");
                        for line in quote.trim_end_matches('\n').split('\n') {
                            chunk.body.push_str("> ");
                            chunk.body.push_str(line);
                            chunk.body.push('\n');
                        }
                        chunk.body.push('\n');
                        chunk.used_tokens += self.overlap_tokens;
                    }
                }
                chunks.push(chunk);
            }
            let cur = chunks.last_mut().expect("chunk list non-empty");
            cur.body.push_str(&block);
            cur.used_tokens += block_tokens;
            cur.files.push((candidate.path.clone(), *lines));
        }

        stats.main_tokens = main_used;

        // Write the container: main document plus chunk siblings. Entries
        // are stored, not deflated; the payload is already plain markdown.
        let mut zip = ZipWriter::new(dst);
        let entry_options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(format!("PromptPack-{}.md", self.profile.label()), entry_options)?;
        zip.write_all(main.as_bytes())?;

        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.used_tokens == 0 {
                continue;
            }
            let mut doc = String::new();
            let _ = writeln!(doc, "# CHUNK {}\n", i + 1);
            doc.push_str("Contents:\n");
            for (path, lines) in &chunk.files {
                let _ = writeln!(doc, "- {path} ({lines} lines)");
            }
            doc.push_str(
                "\nHow to use: ask questions against this chunk only; reference other chunks by number.\n\n",
            );
            doc.push_str(&chunk.body);

            zip.start_file(format!("chunk-{:03}.md", i + 1), entry_options)?;
            zip.write_all(doc.as_bytes())?;
            stats.chunk_files += 1;
        }
        zip.finish()?;
        Ok(stats)
    }
}

impl ScanState {
    fn add_to_tree(&mut self, rel: &str) {
        let mut parent = String::from("repo-root");
        for part in rel.split('/') {
            let children = self.dir_children.entry(parent.clone()).or_default();
            if !children.iter().any(|c| c == part) {
                children.push(part.to_string());
            }
            parent.push('/');
            parent.push_str(part);
        }
    }

    fn add_env(&mut self, name: &str, source: &str, usage: &str) {
        if name.is_empty() {
            return;
        }
        let secret = crate::secrets::is_secret_name(name);
        let var = self.env.entry(name.to_string()).or_default();
        if !source.is_empty() && !var.sources.iter().any(|s| s == source) {
            var.sources.push(source.to_string());
        }
        if !usage.is_empty() && !var.usages.iter().any(|u| u == usage) {
            var.usages.push(usage.to_string());
        }
        if secret {
            var.is_secret = true;
        }
    }

    fn parse_npm(&mut self, content: &str) {
        #[derive(serde::Deserialize, Default)]
        struct Npm {
            #[serde(default)]
            name: String,
            #[serde(default)]
            version: String,
            #[serde(default)]
            dependencies: BTreeMap<String, String>,
            #[serde(default, rename = "devDependencies")]
            dev_dependencies: BTreeMap<String, String>,
        }
        let parsed: Npm = serde_json::from_str(content).unwrap_or_default();
        if !parsed.name.is_empty() {
            self.deps.push(Dep {
                name: parsed.name,
                version: parsed.version,
                source: "npm-project".into(),
            });
        }
        for (cap, source, map) in [
            (15usize, "npm", &parsed.dependencies),
            (10, "npm-dev", &parsed.dev_dependencies),
        ] {
            for (name, version) in map.iter().take(cap) {
                self.deps.push(Dep {
                    name: name.clone(),
                    version: version.clone(),
                    source: source.into(),
                });
            }
        }
    }

    fn parse_go_mod(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if let Some(module) = line.strip_prefix("module ") {
                self.deps.push(Dep {
                    name: module.trim().to_string(),
                    version: String::new(),
                    source: "gomod-module".into(),
                });
            } else if let Some(version) = line.strip_prefix("go ") {
                self.deps.push(Dep {
                    name: "go".into(),
                    version: version.trim().to_string(),
                    source: "gomod".into(),
                });
            } else {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() == 2 && fields[0] != "module" && fields[0] != "go" {
                    self.deps.push(Dep {
                        name: fields[0].to_string(),
                        version: fields[1].to_string(),
                        source: "gomod".into(),
                    });
                }
            }
        }
    }

    fn parse_csproj(&mut self, content: &str) {
        let mut frameworks: Vec<String> = Vec::new();
        for line in content.lines() {
            if let Some(cap) = RE_CSPROJ_TF.captures(line) {
                for tf in cap[1].split(';') {
                    frameworks.push(tf.trim().to_string());
                }
            }
            if let Some(cap) = RE_CSPROJ_PKG.captures(line) {
                self.deps.push(Dep {
                    name: cap[1].to_string(),
                    version: cap[2].to_string(),
                    source: "nuget".into(),
                });
            }
        }
        if !frameworks.is_empty() {
            self.deps.push(Dep {
                name: "TargetFramework".into(),
                version: frameworks.join(","),
                source: "nuget-project".into(),
            });
        }
    }

    fn parse_python_deps(&mut self, base: &str, content: &str) {
        if base == "requirements.txt" {
            // The cap is on the physical line index, so blanks and comments
            // within the first 20 lines shrink the collected set.
            for (i, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if i >= 20 {
                    break;
                }
                self.deps.push(Dep {
                    name: line.to_string(),
                    version: String::new(),
                    source: "pip".into(),
                });
            }
            return;
        }
        let name = RE_PY_NAME
            .captures(content)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let version = RE_PY_VER
            .captures(content)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        if !name.is_empty() {
            self.deps.push(Dep {
                name,
                version,
                source: "pip-project".into(),
            });
        }
    }
}

fn render_summary(
    opts: &PromptPackOptions,
    state: &ScanState,
    total_tokens: u32,
    reserve_tokens: u32,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Prompt Pack — {}/{}@{}",
        opts.owner, opts.repo, opts.reference
    );
    let _ = writeln!(out, "Date: {} (UTC)", Utc::now().format("%Y-%m-%d"));
    let _ = writeln!(out, "Profile: {}", opts.profile.label());
    let _ = writeln!(
        out,
        "Model: {}, token budget: {}, reserved for questions: ~{}",
        opts.model_id, total_tokens, reserve_tokens
    );
    out.push('\n');

    out.push_str("## 01_SUMMARY\n\n");
    if state.readme_lines.is_empty() {
        out.push_str("- **Goal**: (no data)\n");
    } else {
        out.push_str("- **Goal**:\n");
        for line in &state.readme_lines {
            let _ = writeln!(out, "  - {}", line.trim());
        }
    }
    out.push_str("- **Stack**: detected from dependency manifests (see DEPS)\n");
    out.push_str(
        "- **Entry points**: path heuristics (cmd/*/main.go, app/page.tsx, Program.cs)\n",
    );
    out.push_str("- **Run**: see Dockerfile/docker-compose/README (heuristic)\n");
    out.push_str("- **Limits**: binaries and LFS objects may be missing from excerpts\n");
    out.push('\n');
    out
}

fn render_tree(state: &ScanState, depth: usize, limit: usize) -> String {
    let mut out = String::new();
    out.push_str("## 02_TREE\n\n");
    out.push_str("repo-root/\n");
    render_dir(&mut out, &state.dir_children, "repo-root", 0, depth, limit);
    out.push('\n');
    out
}

fn render_dir(
    out: &mut String,
    tree: &BTreeMap<String, Vec<String>>,
    key: &str,
    level: usize,
    max_depth: usize,
    limit: usize,
) {
    if level >= max_depth {
        return;
    }
    let Some(children) = tree.get(key) else {
        return;
    };
    let mut children = children.clone();
    children.sort_unstable();
    let count = children.len();
    for (shown, name) in children.iter().enumerate() {
        if shown >= limit {
            let _ = writeln!(out, "{}├─ … + {} more", "│  ".repeat(level), count - shown);
            break;
        }
        let _ = writeln!(out, "{}├─ {}", "│  ".repeat(level), name);
        // Names without a dot are treated as directories worth descending.
        if !name.contains('.') {
            render_dir(
                out,
                tree,
                &format!("{key}/{name}"),
                level + 1,
                max_depth,
                limit,
            );
        }
    }
}

fn render_deps(state: &ScanState) -> String {
    let mut out = String::new();
    out.push_str("## 03_DEPS\n\n");
    if state.deps.is_empty() {
        out.push_str("_no dependencies detected_\n\n");
        return out;
    }
    let mut groups: BTreeMap<&str, Vec<&Dep>> = BTreeMap::new();
    for dep in &state.deps {
        groups.entry(dep.source.as_str()).or_default().push(dep);
    }
    for (source, deps) in groups {
        let _ = writeln!(out, "### {}\n", source.to_ascii_uppercase());
        out.push_str("| package | version |\n");
        out.push_str("|---------|---------|\n");
        for (i, dep) in deps.iter().enumerate() {
            if i >= 20 {
                out.push_str("| … | … |\n");
                break;
            }
            let _ = writeln!(out, "| {} | {} |", dep.name, dep.version);
        }
        out.push('\n');
    }
    out
}

fn render_env(state: &ScanState) -> String {
    let mut out = String::new();
    out.push_str("## 04_ENV\n\n");
    if state.env.is_empty() {
        out.push_str("_no environment variables detected_\n\n");
        return out;
    }
    out.push_str("| VAR | Source(s) | Usage | Note |\n");
    out.push_str("|-----|-----------|-------|------|\n");
    for (name, var) in &state.env {
        let note = if var.is_secret { "secret" } else { "" };
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            name,
            var.sources.join(", "),
            var.usages.join(", "),
            note
        );
    }
    out.push('\n');
    out
}

fn render_prompts() -> String {
    let mut out = String::new();
    out.push_str("## 05_PROMPTS\n\n");
    out.push_str("- Code review: \"Explain the architecture, entry points and risks. Start with 3 bullets, then per-module detail.\"\n");
    out.push_str("- File refactor: \"Here is the context (below). Rewrite it to satisfy the linter and code style without changing behavior.\"\n");
    out.push_str("- Tests: \"Generate unit tests for X with coverage Y and boundary-case examples.\"\n");
    out.push_str("- Migrations/deploy: \"Update the Dockerfile to the current LTS toolchain. Explain the changes.\"\n");
    out.push_str("- Q&A: \"Answer questions about module X, citing paths and lines from the excerpts.\"\n");
    out.push('\n');
    out
}

fn is_readme(base: &str) -> bool {
    base == "readme" || base.starts_with("readme.")
}

fn read_first_nonempty_lines(r: &mut impl Read, max_lines: usize) -> Vec<String> {
    let mut reader = BufReader::new(r);
    let mut out = Vec::new();
    let mut raw = Vec::new();
    while out.len() < max_lines {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&raw);
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn extract_head(r: &mut impl Read, max_lines: usize) -> (String, usize) {
    let mut reader = BufReader::with_capacity(64 * 1024, r);
    let mut out = String::new();
    let mut lines = 0usize;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        out.push_str(&line);
        out.push('\n');
        lines += 1;
        if max_lines > 0 && lines >= max_lines {
            break;
        }
    }
    (out, lines)
}

fn grep_env_from_dotenv(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, _)) = line.split_once('=') {
            let key = key.trim();
            if is_env_key(key) && !out.iter().any(|k| k == key) {
                out.push(key.to_string());
            }
        }
    }
    out
}

fn grep_env_from_compose(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for cap in RE_ENV_COMPOSE.captures_iter(content) {
        let key = cap[1].to_string();
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

fn is_env_key(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn code_lang_by_ext(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "ts" | "tsx" => "tsx",
        "js" | "jsx" => "jsx",
        "go" => "go",
        "cs" => "csharp",
        "py" => "python",
        "rs" => "rust",
        "json" => "json",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        _ => "",
    }
}

/// Approximate "last N tokens" as the last 4N characters, on char
/// boundaries.
fn last_n_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    if count <= n {
        return text.to_string();
    }
    text.chars().skip(count - n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn readme_names() {
        assert!(is_readme("readme"));
        assert!(is_readme("readme.md"));
        assert!(is_readme("readme.txt"));
        assert!(!is_readme("notreadme.md"));
    }

    #[test]
    fn env_key_charset() {
        assert!(is_env_key("API_KEY"));
        assert!(is_env_key("X1"));
        assert!(!is_env_key("lower_case"));
        assert!(!is_env_key(""));
    }

    #[test]
    fn dotenv_and_compose_extraction() {
        let dotenv = "# comment\nAPI_TOKEN=abc\nlower=skip\nDB_HOST=localhost\n";
        assert_eq!(grep_env_from_dotenv(dotenv), vec!["API_TOKEN", "DB_HOST"]);

        let compose = "services:\n  app:\n    environment:\n      - APP_SECRET=topsecret\n      - PORT=8080\n";
        let vars = grep_env_from_compose(compose);
        assert!(vars.contains(&"APP_SECRET".to_string()));
        assert!(vars.contains(&"PORT".to_string()));
    }

    #[test]
    fn code_env_regexes() {
        assert_eq!(
            RE_ENV_GO.captures(r#"v := os.Getenv("DATABASE_URL")"#).unwrap()[1].to_string(),
            "DATABASE_URL"
        );
        assert_eq!(
            RE_ENV_NODE.captures("const k = process.env.STRIPE_KEY;").unwrap()[1].to_string(),
            "STRIPE_KEY"
        );
        assert_eq!(
            RE_ENV_PY.captures(r#"os.getenv('REDIS_ADDR')"#).unwrap()[1].to_string(),
            "REDIS_ADDR"
        );
    }

    #[test]
    fn go_mod_parsing() {
        let mut state = ScanState {
            dir_children: BTreeMap::new(),
            readme_lines: Vec::new(),
            deps: Vec::new(),
            env: BTreeMap::new(),
            candidates: Vec::new(),
        };
        state.parse_go_mod("module example.com/svc\n\ngo 1.22\n\nrequire (\n)\ngithub.com/lib/pq v1.10.0\n");
        assert!(state
            .deps
            .iter()
            .any(|d| d.source == "gomod-module" && d.name == "example.com/svc"));
        assert!(state
            .deps
            .iter()
            .any(|d| d.name == "go" && d.version == "1.22"));
        assert!(state
            .deps
            .iter()
            .any(|d| d.name == "github.com/lib/pq" && d.version == "v1.10.0"));
    }

    #[test]
    fn npm_parsing_caps_rows() {
        let mut state = ScanState {
            dir_children: BTreeMap::new(),
            readme_lines: Vec::new(),
            deps: Vec::new(),
            env: BTreeMap::new(),
            candidates: Vec::new(),
        };
        let mut deps = String::new();
        for i in 0..25 {
            let _ = write!(deps, "\"pkg{i:02}\": \"1.0.{i}\",");
        }
        deps.pop();
        let json = format!(
            "{{\"name\": \"demo\", \"version\": \"0.1.0\", \"dependencies\": {{{deps}}}}}"
        );
        state.parse_npm(&json);
        let npm_rows = state.deps.iter().filter(|d| d.source == "npm").count();
        assert_eq!(npm_rows, 15);
        assert!(state.deps.iter().any(|d| d.source == "npm-project"));
    }

    #[test]
    fn requirements_cap_is_by_physical_line_index() {
        let mut state = ScanState {
            dir_children: BTreeMap::new(),
            readme_lines: Vec::new(),
            deps: Vec::new(),
            env: BTreeMap::new(),
            candidates: Vec::new(),
        };
        let mut content = String::from("# pinned deps\n\n# generated\n\n");
        for i in 0..30 {
            let _ = writeln!(content, "pkg{i:02}==1.0");
        }
        state.parse_python_deps("requirements.txt", &content);
        // Four comment/blank lines occupy indexes 0..3, so deps sit at
        // indexes 4..33 and the cut at index 20 leaves 16 rows.
        let pip = state.deps.iter().filter(|d| d.source == "pip").count();
        assert_eq!(pip, 16);
        assert!(state.deps.iter().any(|d| d.name == "pkg00==1.0"));
        assert!(!state.deps.iter().any(|d| d.name == "pkg16==1.0"));
    }

    #[test]
    fn excerpt_priority_table_matches() {
        let hit = |p: &str| {
            EXCERPT_FILTERS
                .iter()
                .find(|(re, _)| re.is_match(p))
                .map(|(_, prio)| *prio)
        };
        assert_eq!(hit("README.md"), Some(1));
        assert_eq!(hit("cmd/api/main.go"), Some(1));
        assert_eq!(hit("internal/server/router.go"), Some(2));
        assert_eq!(hit("internal/util/strings.go"), Some(3));
        assert_eq!(hit("src/lib.rs"), Some(3));
        assert_eq!(hit("assets/logo.png"), None);
    }

    #[test]
    fn last_n_chars_respects_boundaries() {
        assert_eq!(last_n_chars("abcdef", 3), "def");
        assert_eq!(last_n_chars("ab", 10), "ab");
        assert_eq!(last_n_chars("ажс", 2), "жс");
    }

    #[test]
    fn tree_rendering_caps_children() {
        let mut state = ScanState {
            dir_children: BTreeMap::new(),
            readme_lines: Vec::new(),
            deps: Vec::new(),
            env: BTreeMap::new(),
            candidates: Vec::new(),
        };
        for i in 0..15 {
            state.add_to_tree(&format!("file{i:02}.txt"));
        }
        let rendered = render_tree(&state, 3, 10);
        assert!(rendered.contains("├─ file00.txt"));
        assert!(rendered.contains("… + 5 more"));
        assert!(!rendered.contains("file12.txt"));
    }
}
