//! Lang tester harness for bytecode programs run through the JIT.

use lang_tester::LangTester;
use regex::Regex;
use std::{fs::read_to_string, path::Path, process::Command};

const COMMENT: &str = ";";
const COMMENT_PREFIX: &str = "##";

fn main() {
    println!("Running bytecode tests...");

    LangTester::new()
        .comment_prefix(COMMENT_PREFIX)
        .test_dir("bytecode")
        .test_path_filter(|p: &Path| p.extension().as_ref().and_then(|p| p.to_str()) == Some("bc"))
        .test_extract(move |p| {
            read_to_string(p)
                .unwrap()
                .lines()
                .skip_while(|l| !l.starts_with(COMMENT))
                .take_while(|l| l.starts_with(COMMENT))
                .map(|l| &l[COMMENT.len()..])
                .collect::<Vec<_>>()
                .join("\n")
        })
        .test_cmds(move |p| {
            let mut cmd = Command::new(env!("CARGO_BIN_EXE_run_bytecode"));
            cmd.arg(p);
            vec![("Run-time", cmd)]
        })
        .fm_options(|_, _, fmb| {
            // Use `{{}}` to match non-literal strings in tests.
            // E.g. use `{{n}}` to capture a counter that must be the same in two places.
            let ptn_re = Regex::new(r"\{\{.+?\}\}").unwrap();
            let ptn_re_ignore = Regex::new(r"\{\{_}\}").unwrap();
            let text_re = Regex::new(r"[a-zA-Z0-9\._]+").unwrap();
            fmb.name_matcher_ignore(ptn_re_ignore, text_re.clone())
                .name_matcher(ptn_re, text_re)
        })
        .run();
}
