#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::fmt::Write;

use yarasweep_scanner::{CompileOptions, MatchEngine, RuleSet};

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// 문자열 정의 (최대 8개로 제한)
    strings: Vec<FuzzString>,
    condition: FuzzCondition,
    /// 스캔 대상 데이터
    data: Vec<u8>,
}

#[derive(Arbitrary, Debug)]
enum FuzzString {
    Text {
        bytes: Vec<u8>,
        nocase: bool,
        wide: bool,
        ascii: bool,
        fullword: bool,
    },
    Hex {
        tokens: Vec<HexToken>,
    },
    Regex {
        pattern: String,
        nocase: bool,
    },
}

#[derive(Arbitrary, Debug)]
enum HexToken {
    Byte(u8),
    Wildcard,
    Jump(u8, u8),
}

#[derive(Arbitrary, Debug)]
enum FuzzCondition {
    Any,
    All,
    AtLeast(u8),
    CountAtLeast(u8),
    FilesizeBelow(u32),
}

fn render_text(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes.iter().take(32) {
        let _ = write!(out, "\\x{b:02x}");
    }
    out
}

fn render_hex(tokens: &[HexToken]) -> String {
    let mut out = Vec::new();
    for token in tokens.iter().take(16) {
        match token {
            HexToken::Byte(b) => out.push(format!("{b:02X}")),
            HexToken::Wildcard => out.push("??".to_owned()),
            HexToken::Jump(a, b) => {
                let (lo, hi) = (a.min(b) % 16, a.max(b) % 16);
                out.push(format!("[{lo}-{hi}]"));
            }
        }
    }
    out.join(" ")
}

fuzz_target!(|input: FuzzInput| {
    let mut source = String::from("rule fuzz_rule {\n    strings:\n");
    let mut count = 0;
    for (i, s) in input.strings.iter().take(8).enumerate() {
        let line = match s {
            FuzzString::Text { bytes, nocase, wide, ascii, fullword } => {
                if bytes.is_empty() {
                    continue;
                }
                let mut line = format!("\"{}\"", render_text(bytes));
                for (on, name) in [(*nocase, "nocase"), (*wide, "wide"), (*ascii, "ascii"), (*fullword, "fullword")] {
                    if on {
                        line.push(' ');
                        line.push_str(name);
                    }
                }
                line
            }
            FuzzString::Hex { tokens } => format!("{{ {} }}", render_hex(tokens)),
            FuzzString::Regex { pattern, nocase } => {
                let pattern: String = pattern.chars().filter(|c| *c != '/' && *c != '\n').take(64).collect();
                if *nocase { format!("/{pattern}/i") } else { format!("/{pattern}/") }
            }
        };
        let _ = writeln!(source, "        $s{i} = {line}");
        count += 1;
    }
    if count == 0 {
        return;
    }

    let condition = match input.condition {
        FuzzCondition::Any => "any of them".to_owned(),
        FuzzCondition::All => "all of them".to_owned(),
        FuzzCondition::AtLeast(n) => format!("{} of them", n % 9),
        FuzzCondition::CountAtLeast(n) => format!("#s0 >= {n}"),
        FuzzCondition::FilesizeBelow(n) => format!("any of them and filesize < {n}"),
    };
    let _ = writeln!(source, "    condition:\n        {condition}\n}}");

    // 잘못된 패턴은 컴파일 에러로 끝나야 하며 크래시는 안 됨
    let Ok(rules) = RuleSet::compile(&source, CompileOptions::default()) else {
        return;
    };

    // 스캔 대상 크기 제한 (성능)
    let data = &input.data[..input.data.len().min(64 * 1024)];
    let _ = rules.scan_bytes(data);
});
