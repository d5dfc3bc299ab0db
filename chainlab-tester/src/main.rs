mod common;
mod logic;

use anyhow::{Context, Result, bail, ensure};
use chainlab_engine::{BundledLoader, EngineConfig, LessonEngine, ScenarioLoader};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::{Path, PathBuf};
use std::time::Instant;

use common::split_csv;
use logic::{LogicTester, ScenarioResult, Strategy, resolve_seed_inputs, validate_catalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Console,
    Json,
    Markdown,
}

#[derive(Debug, Parser)]
#[command(name = "chainlab-tester", version)]
#[command(about = "Automated playthrough testing for ChainLab lessons")]
struct Args {
    /// Lessons to run (comma-separated ids, or `all`)
    #[arg(long, default_value = "all")]
    lessons: String,

    /// Playthrough policies (comma-separated: guided, explorer, idle, or `all`)
    #[arg(long, default_value = "guided")]
    policies: String,

    /// List all bundled lessons and exit
    #[arg(long)]
    list_lessons: bool,

    /// Run static catalog checks and exit
    #[arg(long)]
    validate: bool,

    /// Seeds to run (comma-separated; decimal, 0x-hex or `default`)
    #[arg(long, default_value = "default")]
    seeds: String,

    /// Number of iterations per lesson mode, policy and seed
    #[arg(long, default_value_t = 3)]
    iterations: usize,

    /// Output report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Console)]
    report: ReportFormat,

    /// Engine configuration JSON overriding the bundled defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Optional path to write the report output instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let engine = build_engine(&args)?;

    if maybe_list_lessons(&args, &engine)? {
        return Ok(());
    }

    if args.validate {
        let clean = run_validation(&args, &engine)?;
        if !clean {
            std::process::exit(1);
        }
        return Ok(());
    }

    announce_banner();

    let start_time = Instant::now();
    let lessons = expand_lessons(&args.lessons, &engine.lessons())?;
    let strategies = expand_policies(&args.policies)?;
    let seeds = resolve_seed_inputs(&split_csv(&args.seeds), engine.config().seed)?;

    let results = run_playthroughs(&args, &engine, &lessons, &strategies, &seeds)?;
    write_reports(&args, &results, start_time)?;

    if results.iter().any(|r| !r.passed) {
        std::process::exit(1);
    }

    Ok(())
}

fn build_engine(args: &Args) -> Result<LessonEngine<BundledLoader>> {
    let loader = BundledLoader::new().context("bundled lessons failed to load")?;
    match &args.config {
        Some(path) => {
            let config = load_config_file(path)?;
            Ok(LessonEngine::with_config(loader, config))
        }
        None => LessonEngine::from_loader(loader).context("bundled engine configuration is invalid"),
    }
}

fn load_config_file(path: &Path) -> Result<EngineConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    EngineConfig::from_json(&json).with_context(|| format!("invalid configuration in {}", path.display()))
}

fn maybe_list_lessons(args: &Args, engine: &LessonEngine<BundledLoader>) -> Result<bool> {
    if !args.list_lessons {
        return Ok(false);
    }
    let mut output_target = OutputTarget::new(args.output.clone())?;
    logic::reports::generate_catalog_listing(
        output_target.writer(),
        &engine.loader().catalog().summaries(),
    )?;
    output_target.flush_inner()?;
    Ok(true)
}

fn run_validation(args: &Args, engine: &LessonEngine<BundledLoader>) -> Result<bool> {
    let catalog = engine.loader().catalog();
    let issues = validate_catalog(catalog);
    let mut output_target = OutputTarget::new(args.output.clone())?;
    let out = output_target.writer();
    match args.report {
        ReportFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(&issues)?)?,
        ReportFormat::Console | ReportFormat::Markdown => {
            if issues.is_empty() {
                writeln!(out, "✅ {} lessons passed catalog validation", catalog.len())?;
            } else {
                writeln!(out, "❌ {} catalog issues:", issues.len())?;
                for issue in &issues {
                    writeln!(out, "  • {issue}")?;
                }
            }
        }
    }
    output_target.flush_inner()?;
    Ok(issues.is_empty())
}

fn announce_banner() {
    println!("{}", "🔗 ChainLab Lesson Tester".bright_cyan().bold());
    println!("{}", "=========================".cyan());
}

fn expand_lessons(lessons_arg: &str, available: &[String]) -> Result<Vec<String>> {
    let requested = split_csv(lessons_arg);
    if requested.iter().any(|l| l == "all") {
        return Ok(available.to_vec());
    }
    ensure!(!requested.is_empty(), "no lessons requested");
    for lesson in &requested {
        if !available.contains(lesson) {
            bail!("Unknown lesson: {lesson} (see --list-lessons)");
        }
    }
    Ok(requested)
}

fn expand_policies(policies_arg: &str) -> Result<Vec<Strategy>> {
    let mut strategies = Vec::new();
    for token in split_csv(policies_arg) {
        if token.eq_ignore_ascii_case("all") {
            return Ok(Strategy::ALL.to_vec());
        }
        let strategy = Strategy::parse(&token)?;
        if !strategies.contains(&strategy) {
            strategies.push(strategy);
        }
    }
    ensure!(!strategies.is_empty(), "no policies requested");
    Ok(strategies)
}

fn run_playthroughs(
    args: &Args,
    engine: &LessonEngine<BundledLoader>,
    lessons: &[String],
    strategies: &[Strategy],
    seeds: &[u64],
) -> Result<Vec<ScenarioResult>> {
    println!("{}", "🧠 Running Lesson Playthroughs".bright_yellow().bold());
    println!("{}", "-".repeat(30).yellow());

    let tester = LogicTester::new(engine, args.verbose);
    let mut results = Vec::new();
    for lesson in lessons {
        for &strategy in strategies {
            results.extend(tester.run_lesson(lesson, strategy, seeds, args.iterations)?);
        }
    }
    Ok(results)
}

fn write_reports(args: &Args, results: &[ScenarioResult], start_time: Instant) -> Result<()> {
    let mut output_target = OutputTarget::new(args.output.clone())?;

    match args.report {
        ReportFormat::Json => {
            if results.is_empty() {
                writeln!(&mut output_target, "[]")?;
            } else {
                logic::reports::generate_json_report(&mut output_target, results)?;
            }
        }
        ReportFormat::Markdown => {
            if results.is_empty() {
                writeln!(
                    &mut output_target,
                    "# ChainLab Lesson Test Results\n\n_No lessons executed._"
                )?;
            } else {
                logic::reports::generate_markdown_report(&mut output_target, results)?;
            }
        }
        ReportFormat::Console => {
            if results.is_empty() {
                writeln!(&mut output_target, "No lessons executed.")?;
            } else {
                logic::reports::generate_console_report(
                    &mut output_target,
                    results,
                    start_time.elapsed(),
                )?;
            }
            writeln!(&mut output_target)?;
            writeln!(&mut output_target, "🏁 Total time: {:?}", start_time.elapsed())?;
        }
    }

    output_target.flush_inner()?;
    Ok(())
}

enum OutputTarget {
    Stdout(BufWriter<std::io::Stdout>),
    File(BufWriter<File>),
}

impl OutputTarget {
    fn new(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Self::File(BufWriter::new(file)))
        } else {
            Ok(Self::Stdout(BufWriter::new(stdout())))
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stdout(w) => w,
            Self::File(w) => w,
        }
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout(w) => w.flush(),
            Self::File(w) => w.flush(),
        }
    }
}

impl Write for OutputTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            lessons: "mini-app".to_string(),
            policies: "guided".to_string(),
            list_lessons: false,
            validate: false,
            seeds: "1337".to_string(),
            iterations: 1,
            report: ReportFormat::Json,
            config: None,
            verbose: false,
            output: None,
        }
    }

    fn temp_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "chainlab-main-{label}-{}",
            std::process::id()
        ))
    }

    fn available() -> Vec<String> {
        build_engine(&base_args()).unwrap().lessons()
    }

    #[test]
    fn expands_all_lessons_keyword() {
        let available = available();
        let expanded = expand_lessons("all", &available).unwrap();
        assert_eq!(expanded, available);
        assert_eq!(expanded.len(), 10);
    }

    #[test]
    fn expand_lessons_preserves_order_and_rejects_unknown() {
        let available = available();
        let expanded = expand_lessons("mini-app, first-transaction", &available).unwrap();
        assert_eq!(expanded, vec!["mini-app", "first-transaction"]);
        assert!(expand_lessons("mini-app,warp-drive", &available).is_err());
        assert!(expand_lessons(" , ", &available).is_err());
    }

    #[test]
    fn expands_policies() {
        assert_eq!(expand_policies("all").unwrap(), Strategy::ALL.to_vec());
        assert_eq!(
            expand_policies("idle,guided,idle").unwrap(),
            vec![Strategy::Idle, Strategy::Guided]
        );
        assert!(expand_policies("cheater").is_err());
    }

    #[test]
    fn config_file_overrides_the_seed() {
        let path = temp_path("config.json");
        std::fs::write(&path, r#"{ "seed": 77, "time_scale": 0.5 }"#).unwrap();
        let args = Args {
            config: Some(path),
            ..base_args()
        };
        let engine = build_engine(&args).unwrap();
        assert_eq!(engine.config().seed, 77);
        assert!((engine.config().time_scale - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_config_file_is_reported() {
        let path = temp_path("bad-config.json");
        std::fs::write(&path, r#"{ "max_pump": 0 }"#).unwrap();
        let args = Args {
            config: Some(path),
            ..base_args()
        };
        let err = build_engine(&args).err().unwrap();
        assert!(format!("{err:#}").contains("invalid configuration"));
    }

    #[test]
    fn maybe_list_lessons_writes_output() {
        let path = temp_path("list.txt");
        let args = Args {
            list_lessons: true,
            output: Some(path.clone()),
            ..base_args()
        };
        let engine = build_engine(&args).unwrap();
        assert!(maybe_list_lessons(&args, &engine).unwrap());
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("Available lessons"));
        assert!(content.contains("gas-under-pressure"));
    }

    #[test]
    fn validation_passes_for_bundled_lessons() {
        let path = temp_path("validate.json");
        let args = Args {
            validate: true,
            output: Some(path.clone()),
            ..base_args()
        };
        let engine = build_engine(&args).unwrap();
        assert!(run_validation(&args, &engine).unwrap());
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.trim(), "[]");
    }

    #[test]
    fn write_reports_emits_json_for_results() {
        let path = temp_path("report.json");
        let args = Args {
            output: Some(path.clone()),
            ..base_args()
        };
        let engine = build_engine(&args).unwrap();
        let results = run_playthroughs(
            &args,
            &engine,
            &["mini-app".to_string()],
            &[Strategy::Guided],
            &[1337],
        )
        .unwrap();
        assert!(results.iter().all(|r| r.passed));
        write_reports(&args, &results, Instant::now()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("scenario_name"));
        assert!(content.contains("mini-app/standard [guided]"));
    }

    #[test]
    fn write_reports_markdown_empty_results() {
        let path = temp_path("empty.md");
        let args = Args {
            report: ReportFormat::Markdown,
            output: Some(path.clone()),
            ..base_args()
        };
        write_reports(&args, &[], Instant::now()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("No lessons executed"));
    }

    #[test]
    fn output_target_stdout_writes() {
        let mut target = OutputTarget::new(None).unwrap();
        target.write_all(b"ok").unwrap();
        target.flush().unwrap();
    }
}
