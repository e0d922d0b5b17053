//! The test runner the harness hands control to once startup is done.
//!
//! It understands the subset of libtest's command line that `cargo test` and `cargo nextest`
//! pass to custom harnesses.

use std::io::{self, Write as _};
use std::panic::{catch_unwind, AssertUnwindSafe};

use clap::{Parser, ValueEnum};
use tracing::{debug, error};

use crate::error::Error;
use crate::panic::panic_to_string;

#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Multi-process test binary")]
pub struct Cli {
    /// Run only the tests whose names contain this string.
    pub filter: Option<String>,

    /// Match the filter against the whole test name instead of a substring.
    #[arg(long)]
    pub exact: bool,

    /// Skip the tests whose names contain this string. May be repeated.
    #[arg(long, value_name = "FILTER")]
    pub skip: Vec<String>,

    /// List the tests instead of running them.
    #[arg(long)]
    pub list: bool,

    /// The output format.
    #[arg(long, value_enum)]
    pub format: Option<Format>,

    /// Print only the summary.
    #[arg(short, long)]
    pub quiet: bool,

    /// Run only ignored tests. No test is ignored up front, so this selects nothing.
    #[arg(long)]
    pub ignored: bool,

    /// Accepted for compatibility with libtest. Output is never captured.
    #[arg(long)]
    pub nocapture: bool,

    /// Accepted for compatibility with libtest. Tests always run one after another.
    #[arg(long, value_name = "N")]
    pub test_threads: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Pretty,
    Terse,
}

impl Cli {
    fn is_selected(&self, name: &str) -> bool {
        if self.ignored {
            return false;
        }
        let matches = |pattern: &str| {
            if self.exact {
                name == pattern
            } else {
                name.contains(pattern)
            }
        };
        if let Some(filter) = &self.filter {
            if !matches(filter) {
                return false;
            }
        }
        !self.skip.iter().any(|skip| matches(skip))
    }
}

/// A registered test.
pub struct Test<C> {
    pub name: &'static str,
    pub func: fn(&C) -> anyhow::Result<()>,
}

/// The result of a single test.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
    Ignored(String),
}

/// The summary of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Conclusion {
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
    pub filtered_out: usize,
}

impl Conclusion {
    /// libtest's convention: 101 if anything failed.
    pub fn exit_code(&self) -> u8 {
        if self.failed > 0 {
            101
        } else {
            0
        }
    }
}

/// Runs a single test and classifies the result.
pub fn run_one<C>(test: &Test<C>, ctx: &C) -> Outcome {
    match catch_unwind(AssertUnwindSafe(|| (test.func)(ctx))) {
        Ok(Ok(())) => Outcome::Passed,
        Ok(Err(err)) => match Error::skip_reason(&err) {
            Some(reason) => Outcome::Ignored(reason.to_string()),
            None => Outcome::Failed(format!("{:?}", err)),
        },
        Err(panic_box) => Outcome::Failed(panic_to_string("test panicked", panic_box)),
    }
}

/// Runs the selected tests one after another and prints libtest-style output to `out`.
pub fn run<C>(
    cli: &Cli,
    tests: &[Test<C>],
    ctx: &C,
    out: &mut dyn io::Write,
) -> io::Result<Conclusion> {
    let selected: Vec<&Test<C>> = tests.iter().filter(|t| cli.is_selected(t.name)).collect();
    let mut conclusion = Conclusion {
        filtered_out: tests.len() - selected.len(),
        ..Conclusion::default()
    };

    if cli.list {
        for test in &selected {
            writeln!(out, "{}: test", test.name)?;
        }
        if cli.format != Some(Format::Terse) {
            writeln!(out)?;
            writeln!(out, "{} tests", selected.len())?;
        }
        return Ok(conclusion);
    }

    let terse = cli.quiet || cli.format == Some(Format::Terse);
    writeln!(out)?;
    writeln!(out, "running {} tests", selected.len())?;
    let mut failures = Vec::new();
    for test in selected {
        debug!(test = test.name, "running test");
        let outcome = run_one(test, ctx);
        let label = match &outcome {
            Outcome::Passed => {
                conclusion.passed += 1;
                "ok".to_string()
            }
            Outcome::Failed(msg) => {
                conclusion.failed += 1;
                error!(test = test.name, "{}", msg);
                failures.push((test.name, msg.clone()));
                "FAILED".to_string()
            }
            Outcome::Ignored(reason) => {
                conclusion.ignored += 1;
                format!("ignored, {}", reason)
            }
        };
        if !terse {
            writeln!(out, "test {} ... {}", test.name, label)?;
        }
        out.flush()?;
    }

    if !failures.is_empty() {
        writeln!(out)?;
        writeln!(out, "failures:")?;
        for (name, msg) in &failures {
            writeln!(out, "---- {} ----", name)?;
            writeln!(out, "{}", msg)?;
        }
    }
    writeln!(out)?;
    writeln!(
        out,
        "test result: {}. {} passed; {} failed; {} ignored; {} filtered out",
        if conclusion.failed == 0 { "ok" } else { "FAILED" },
        conclusion.passed,
        conclusion.failed,
        conclusion.ignored,
        conclusion.filtered_out,
    )?;
    writeln!(out)?;
    Ok(conclusion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn passes(_: &()) -> anyhow::Result<()> {
        Ok(())
    }

    fn fails(_: &()) -> anyhow::Result<()> {
        bail!("expected 1, got 2")
    }

    fn panics(_: &()) -> anyhow::Result<()> {
        panic!("index out of bounds")
    }

    fn skips(_: &()) -> anyhow::Result<()> {
        Err(Error::Skipped("no fork on this platform".to_string()).into())
    }

    fn test(name: &'static str, func: fn(&()) -> anyhow::Result<()>) -> Test<()> {
        Test { name, func }
    }

    fn tests() -> Vec<Test<()>> {
        vec![
            test("basic::passes", passes),
            test("basic::fails", fails),
            test("basic::panics", panics),
            test("platform::skips", skips),
        ]
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("prog").chain(args.iter().copied())).unwrap()
    }

    fn run_with(args: &[&str]) -> (Conclusion, String) {
        let mut out = Vec::new();
        let conclusion = run(&cli(args), &tests(), &(), &mut out).unwrap();
        (conclusion, String::from_utf8(out).unwrap())
    }

    #[test]
    fn outcomes() {
        let tests = tests();
        assert_eq!(run_one(&tests[0], &()), Outcome::Passed);
        assert!(matches!(run_one(&tests[1], &()), Outcome::Failed(m) if m.contains("expected 1")));
        assert!(
            matches!(run_one(&tests[2], &()), Outcome::Failed(m) if m.contains("index out of bounds"))
        );
        assert_eq!(
            run_one(&tests[3], &()),
            Outcome::Ignored("no fork on this platform".to_string())
        );
    }

    #[test]
    fn full_run() {
        let (conclusion, out) = run_with(&[]);
        assert_eq!(
            conclusion,
            Conclusion {
                passed: 1,
                failed: 2,
                ignored: 1,
                filtered_out: 0
            }
        );
        assert_eq!(conclusion.exit_code(), 101);
        assert!(out.contains("test basic::passes ... ok"));
        assert!(out.contains("test platform::skips ... ignored, no fork on this platform"));
        assert!(out.contains("test result: FAILED. 1 passed; 2 failed; 1 ignored; 0 filtered out"));
    }

    #[test]
    fn filter_and_skip() {
        let (conclusion, _) = run_with(&["basic", "--skip", "fails", "--skip", "panics"]);
        assert_eq!(conclusion.passed, 1);
        assert_eq!(conclusion.failed, 0);
        assert_eq!(conclusion.filtered_out, 3);
        assert_eq!(conclusion.exit_code(), 0);
    }

    #[test]
    fn exact_filter() {
        let (conclusion, _) = run_with(&["passes", "--exact"]);
        assert_eq!(conclusion.passed + conclusion.failed + conclusion.ignored, 0);

        let (conclusion, _) = run_with(&["basic::passes", "--exact"]);
        assert_eq!(conclusion.passed, 1);
        assert_eq!(conclusion.filtered_out, 3);
    }

    #[test]
    fn list_terse() {
        let (conclusion, out) = run_with(&["--list", "--format", "terse"]);
        assert_eq!(
            out,
            "basic::passes: test\nbasic::fails: test\nbasic::panics: test\nplatform::skips: test\n"
        );
        assert_eq!(conclusion.exit_code(), 0);
    }

    #[test]
    fn libtest_flags_are_accepted() {
        let cli = cli(&["--nocapture", "--test-threads", "4", "-q"]);
        assert!(cli.nocapture && cli.quiet);
        assert_eq!(cli.test_threads, Some(4));
    }

    #[test]
    fn nothing_is_ignored_up_front() {
        let (conclusion, out) = run_with(&["--list", "--format", "terse", "--ignored"]);
        assert_eq!(out, "");
        assert_eq!(conclusion.filtered_out, 4);
    }
}
