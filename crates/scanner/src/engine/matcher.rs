//! 규칙 컴파일 및 매칭 -- 문자열 패턴을 바이트 정규식으로 변환하고 조건을 평가
//!
//! 모든 문자열 패턴(텍스트, 16진, 정규식)은 컴파일 시 한 번만
//! `regex::bytes::Regex`로 변환됩니다. 조건식의 문자열/규칙 참조는
//! 인덱스로 해석되어 스캔 시 이름 조회가 없습니다.

use std::collections::{BTreeMap, HashSet};

use regex::bytes::{Regex, RegexBuilder};

use yarasweep_core::types::Severity;

use super::RuleMatch;
use super::parser::ParsedSource;
use super::types::{
    CmpOp, Condition, HexToken, IntExpr, IntRead, Quantifier, RuleDef, StringDef,
    StringModifiers, StringPattern, StringSet,
};
use crate::error::ScannerError;

/// 문자열 하나당 최대 매칭 수
const MAX_MATCHES_PER_STRING: usize = 100_000;

/// 컴파일된 정규식 크기 상한
const REGEX_SIZE_LIMIT: usize = 32 * 1024 * 1024;

/// 심각도 메타데이터 키
const SEVERITY_META_KEY: &str = "severity";

/// 인덱스로 해석된 정수 식
#[derive(Debug, Clone)]
enum Value {
    Literal(i64),
    Filesize,
    Count(usize),
    Read { read: IntRead, offset: Box<Value> },
    Add(Box<Value>, Box<Value>),
    Sub(Box<Value>, Box<Value>),
}

/// 인덱스로 해석된 조건식
#[derive(Debug, Clone)]
enum Expr {
    Bool(bool),
    Matched(usize),
    At { index: usize, offset: Value },
    In { index: usize, start: Value, end: Value },
    Compare { lhs: Value, op: CmpOp, rhs: Value },
    Of { quantifier: Quantifier, indices: Vec<usize> },
    Rule(usize),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Debug)]
struct CompiledString {
    id: String,
    regex: Regex,
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    private: bool,
    global: bool,
    severity: Severity,
    metadata: BTreeMap<String, String>,
    strings: Vec<CompiledString>,
    condition: Expr,
}

/// 컴파일된 규칙 집합
#[derive(Debug, Default)]
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
}

/// 규칙 단위 컴파일 결과
#[derive(Debug, Default)]
pub struct Compilation {
    /// 컴파일에 성공한 규칙
    pub rules: CompiledRules,
    /// 성공한 규칙과 import에서 나온 경고
    pub warnings: Vec<String>,
    /// 컴파일하지 못한 규칙의 에러 (선언 순서)
    pub rejected: Vec<ScannerError>,
}

impl CompiledRules {
    /// 파싱된 소스를 컴파일합니다. 경고 목록을 함께 반환합니다.
    ///
    /// # Errors
    ///
    /// 정의되지 않은 문자열/규칙 참조, 중복 규칙 이름, 잘못된 패턴이 있으면 실패합니다.
    pub fn compile(parsed: &ParsedSource) -> Result<(Self, Vec<String>), ScannerError> {
        let Compilation {
            rules,
            warnings,
            mut rejected,
        } = Self::compile_each(parsed);
        if rejected.is_empty() {
            Ok((rules, warnings))
        } else {
            Err(rejected.remove(0))
        }
    }

    /// 규칙을 하나씩 컴파일합니다. 실패한 규칙은 제외하고 에러를 모읍니다.
    ///
    /// 제외된 규칙을 참조하는 규칙도 정의되지 않은 참조로 제외됩니다.
    pub fn compile_each(parsed: &ParsedSource) -> Compilation {
        let mut compilation = Compilation {
            warnings: parsed
                .imports
                .iter()
                .map(|module| format!("import \"{module}\" is not supported and was ignored"))
                .collect(),
            ..Compilation::default()
        };

        for def in &parsed.rules {
            let rules = &mut compilation.rules.rules;
            if rules.iter().any(|r| r.name == def.name) {
                compilation.rejected.push(ScannerError::RuleSyntax {
                    line: def.line,
                    reason: format!("duplicated rule identifier '{}'", def.name),
                });
                continue;
            }
            let mut warnings = Vec::new();
            match compile_rule(def, rules, &mut warnings) {
                Ok(rule) => {
                    rules.push(rule);
                    compilation.warnings.extend(warnings);
                }
                Err(e) => compilation.rejected.push(e),
            }
        }
        compilation
    }

    /// 규칙 수
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 규칙이 없는지 여부
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 데이터에 매칭되는 공개 규칙을 선언 순서로 반환합니다.
    ///
    /// `global` 규칙 중 하나라도 거짓이면 아무 규칙도 매칭되지 않습니다.
    pub fn scan(&self, data: &[u8]) -> Vec<RuleMatch> {
        let mut results: Vec<bool> = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let mut eval = Evaluator::new(rule, data, &results);
            let matched = eval.eval(&rule.condition);
            results.push(matched);
        }

        let global_failed = self
            .rules
            .iter()
            .zip(&results)
            .any(|(rule, matched)| rule.global && !matched);
        if global_failed {
            return Vec::new();
        }

        self.rules
            .iter()
            .zip(&results)
            .filter(|(rule, matched)| **matched && !rule.private)
            .map(|(rule, _)| RuleMatch {
                rule: rule.name.clone(),
                severity: rule.severity,
                metadata: rule.metadata.clone(),
                matched_strings: rule
                    .strings
                    .iter()
                    .filter(|s| s.regex.is_match(data))
                    .map(|s| s.id.clone())
                    .collect(),
            })
            .collect()
    }
}

/// 규칙 하나의 조건 평가기. 문자열별 매칭 위치를 지연 계산하여 캐싱합니다.
struct Evaluator<'a> {
    rule: &'a CompiledRule,
    data: &'a [u8],
    previous: &'a [bool],
    offsets: Vec<Option<Vec<usize>>>,
}

impl<'a> Evaluator<'a> {
    fn new(rule: &'a CompiledRule, data: &'a [u8], previous: &'a [bool]) -> Self {
        Self {
            rule,
            data,
            previous,
            offsets: vec![None; rule.strings.len()],
        }
    }

    fn offsets(&mut self, index: usize) -> &[usize] {
        let rule = self.rule;
        let regex = &rule.strings[index].regex;
        let data = self.data;
        self.offsets[index].get_or_insert_with(|| {
            regex
                .find_iter(data)
                .take(MAX_MATCHES_PER_STRING)
                .map(|m| m.start())
                .collect()
        })
    }

    fn matched(&mut self, index: usize) -> bool {
        match &self.offsets[index] {
            Some(found) => !found.is_empty(),
            None => self.rule.strings[index].regex.is_match(self.data),
        }
    }

    /// 정수 식을 평가합니다. 범위를 벗어난 읽기나 오버플로는 `None`.
    fn value(&mut self, value: &Value) -> Option<i64> {
        match value {
            Value::Literal(n) => Some(*n),
            Value::Filesize => i64::try_from(self.data.len()).ok(),
            Value::Count(index) => i64::try_from(self.offsets(*index).len()).ok(),
            Value::Read { read, offset } => {
                let offset = usize::try_from(self.value(offset)?).ok()?;
                read.read(self.data, offset)
            }
            Value::Add(lhs, rhs) => self.value(lhs)?.checked_add(self.value(rhs)?),
            Value::Sub(lhs, rhs) => self.value(lhs)?.checked_sub(self.value(rhs)?),
        }
    }

    fn eval(&mut self, expr: &Expr) -> bool {
        match expr {
            Expr::Bool(b) => *b,
            Expr::Matched(index) => self.matched(*index),
            Expr::At { index, offset } => {
                let Some(at) = self.value(offset).and_then(|v| usize::try_from(v).ok()) else {
                    return false;
                };
                self.offsets(*index).binary_search(&at).is_ok()
            }
            Expr::In { index, start, end } => {
                let (Some(start), Some(end)) = (self.value(start), self.value(end)) else {
                    return false;
                };
                self.offsets(*index).iter().any(|&o| {
                    i64::try_from(o).is_ok_and(|o| (start..=end).contains(&o))
                })
            }
            Expr::Compare { lhs, op, rhs } => match (self.value(lhs), self.value(rhs)) {
                (Some(lhs), Some(rhs)) => op.apply(lhs, rhs),
                _ => false,
            },
            Expr::Of {
                quantifier,
                indices,
            } => {
                let hits = indices.iter().filter(|i| self.matched(**i)).count() as u64;
                match quantifier {
                    Quantifier::Any => hits >= 1,
                    Quantifier::All => hits == indices.len() as u64,
                    Quantifier::None => hits == 0,
                    Quantifier::AtLeast(n) => hits >= *n,
                }
            }
            Expr::Rule(index) => self.previous.get(*index).copied().unwrap_or(false),
            Expr::Not(inner) => !self.eval(inner),
            Expr::And(items) => items.iter().all(|item| self.eval(item)),
            Expr::Or(items) => items.iter().any(|item| self.eval(item)),
        }
    }
}

fn compile_rule(
    def: &RuleDef,
    previous: &[CompiledRule],
    warnings: &mut Vec<String>,
) -> Result<CompiledRule, ScannerError> {
    let strings = def
        .strings
        .iter()
        .map(|s| {
            Ok(CompiledString {
                id: s.id.clone(),
                regex: string_regex(&def.name, s)?,
            })
        })
        .collect::<Result<Vec<_>, ScannerError>>()?;

    let condition = resolve(&def.condition, def, previous)?;

    let mut refs = Vec::new();
    let mut uses_them = false;
    def.condition.collect_string_refs(&mut refs, &mut uses_them);
    if def.strings.is_empty() && !def.private {
        warnings.push(format!("rule '{}' has no strings", def.name));
    }
    if !uses_them {
        for s in &def.strings {
            let used = refs.iter().any(|r| id_matches(r, &s.id));
            if !used {
                warnings.push(format!(
                    "string {} in rule '{}' is never used in the condition",
                    s.id, def.name
                ));
            }
        }
    }

    let mut severity = Severity::Low;
    let mut metadata = BTreeMap::new();
    for (key, value) in &def.meta {
        if key == SEVERITY_META_KEY {
            match Severity::from_str_loose(&value.to_string()) {
                Some(s) => severity = s,
                None => warnings.push(format!(
                    "rule '{}' has unknown severity '{value}', using low",
                    def.name
                )),
            }
        }
        // 같은 키가 반복되면 마지막 값이 유지됨
        metadata.insert(key.clone(), value.to_string());
    }

    Ok(CompiledRule {
        name: def.name.clone(),
        private: def.private,
        global: def.global,
        severity,
        metadata,
        strings,
        condition,
    })
}

/// `$a*` 와일드카드 또는 정확한 식별자로 매칭합니다.
fn id_matches(pattern: &str, id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => pattern == id,
    }
}

fn resolve(
    cond: &Condition,
    def: &RuleDef,
    previous: &[CompiledRule],
) -> Result<Expr, ScannerError> {
    let undefined = |what: String| ScannerError::RuleSyntax {
        line: def.line,
        reason: format!("{what} in rule '{}'", def.name),
    };
    let string_index = |id: &str| {
        def.strings
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| undefined(format!("undefined string identifier '{id}'")))
    };

    Ok(match cond {
        Condition::Bool(b) => Expr::Bool(*b),
        Condition::StringRef(id) => Expr::Matched(string_index(id)?),
        Condition::StringAt { id, offset } => Expr::At {
            index: string_index(id)?,
            offset: resolve_value(offset, def)?,
        },
        Condition::StringIn { id, start, end } => Expr::In {
            index: string_index(id)?,
            start: resolve_value(start, def)?,
            end: resolve_value(end, def)?,
        },
        Condition::Compare { lhs, op, rhs } => Expr::Compare {
            lhs: resolve_value(lhs, def)?,
            op: *op,
            rhs: resolve_value(rhs, def)?,
        },
        Condition::Of { quantifier, set } => {
            let indices: Vec<usize> = match set {
                StringSet::Them => (0..def.strings.len()).collect(),
                StringSet::Patterns(patterns) => {
                    let mut seen = HashSet::new();
                    let mut indices = Vec::new();
                    for pattern in patterns {
                        if !def.strings.iter().any(|s| id_matches(pattern, &s.id)) {
                            return Err(undefined(format!(
                                "undefined string identifier '{pattern}'"
                            )));
                        }
                        for (i, s) in def.strings.iter().enumerate() {
                            if id_matches(pattern, &s.id) && seen.insert(i) {
                                indices.push(i);
                            }
                        }
                    }
                    indices
                }
            };
            if indices.is_empty() {
                return Err(undefined("'of' applied to an empty string set".to_owned()));
            }
            Expr::Of {
                quantifier: *quantifier,
                indices,
            }
        }
        Condition::RuleRef(name) => {
            let index = previous
                .iter()
                .position(|r| &r.name == name)
                .ok_or_else(|| undefined(format!("undefined identifier '{name}'")))?;
            Expr::Rule(index)
        }
        Condition::Not(inner) => Expr::Not(Box::new(resolve(inner, def, previous)?)),
        Condition::And(items) => Expr::And(
            items
                .iter()
                .map(|c| resolve(c, def, previous))
                .collect::<Result<_, _>>()?,
        ),
        Condition::Or(items) => Expr::Or(
            items
                .iter()
                .map(|c| resolve(c, def, previous))
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn resolve_value(value: &IntExpr, def: &RuleDef) -> Result<Value, ScannerError> {
    Ok(match value {
        IntExpr::Literal(n) => Value::Literal(*n),
        IntExpr::Filesize => Value::Filesize,
        IntExpr::Count(id) => Value::Count(
            def.strings
                .iter()
                .position(|s| &s.id == id)
                .ok_or_else(|| ScannerError::RuleSyntax {
                    line: def.line,
                    reason: format!("undefined string identifier '{id}' in rule '{}'", def.name),
                })?,
        ),
        IntExpr::Read { read, offset } => Value::Read {
            read: *read,
            offset: Box::new(resolve_value(offset, def)?),
        },
        IntExpr::Add(lhs, rhs) => Value::Add(
            Box::new(resolve_value(lhs, def)?),
            Box::new(resolve_value(rhs, def)?),
        ),
        IntExpr::Sub(lhs, rhs) => Value::Sub(
            Box::new(resolve_value(lhs, def)?),
            Box::new(resolve_value(rhs, def)?),
        ),
    })
}

// --- 패턴 변환 ---

fn string_regex(rule: &str, def: &StringDef) -> Result<Regex, ScannerError> {
    let source = match &def.pattern {
        StringPattern::Text(bytes) => text_pattern(bytes, def.modifiers),
        StringPattern::Hex(tokens) => format!("(?s-u){}", hex_pattern(tokens)),
        StringPattern::Regex {
            pattern,
            case_insensitive,
            dot_all,
        } => {
            let mut flags = String::from("(?");
            if *case_insensitive || def.modifiers.nocase {
                flags.push('i');
            }
            if *dot_all {
                flags.push('s');
            }
            flags.push_str("-u)");
            format!("{flags}(?:{pattern})")
        }
    };

    RegexBuilder::new(&source)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| ScannerError::RulePattern {
            rule: rule.to_owned(),
            string_id: def.id.clone(),
            reason: e.to_string(),
        })
}

fn byte_literal(b: u8, nocase: bool) -> String {
    if nocase && b.is_ascii_alphabetic() {
        format!(
            "[\\x{:02x}\\x{:02x}]",
            b.to_ascii_lowercase(),
            b.to_ascii_uppercase()
        )
    } else {
        format!("\\x{b:02x}")
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn text_pattern(bytes: &[u8], modifiers: StringModifiers) -> String {
    let ascii: String = bytes
        .iter()
        .map(|b| byte_literal(*b, modifiers.nocase))
        .collect();
    let body = if modifiers.wide {
        let wide: String = bytes
            .iter()
            .map(|b| format!("{}\\x00", byte_literal(*b, modifiers.nocase)))
            .collect();
        if modifiers.ascii {
            format!("(?:{ascii}|{wide})")
        } else {
            wide
        }
    } else {
        ascii
    };

    let mut source = String::from("(?s-u)");
    // 단어 경계는 경계 쪽 바이트가 단어 문자일 때만 의미가 있음
    let first_word = bytes.first().is_some_and(|b| is_word_byte(*b));
    let last_word = bytes.last().is_some_and(|b| is_word_byte(*b));
    if modifiers.fullword && first_word {
        source.push_str(r"\b");
    }
    source.push_str(&body);
    if modifiers.fullword && last_word && !modifiers.wide {
        source.push_str(r"\b");
    }
    source
}

fn hex_pattern(tokens: &[HexToken]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            HexToken::Byte(b) => out.push_str(&format!("\\x{b:02x}")),
            HexToken::Masked { mask: 0, .. } => out.push('.'),
            HexToken::Masked { value, mask } => {
                out.push('[');
                for candidate in 0..=u8::MAX {
                    if candidate & mask == value & mask {
                        out.push_str(&format!("\\x{candidate:02x}"));
                    }
                }
                out.push(']');
            }
            HexToken::Jump { min, max: Some(max) } => out.push_str(&format!(".{{{min},{max}}}")),
            HexToken::Jump { min, max: None } => out.push_str(&format!(".{{{min},}}")),
            HexToken::Alternatives(alternatives) => {
                let parts: Vec<String> = alternatives.iter().map(|alt| hex_pattern(alt)).collect();
                out.push_str(&format!("(?:{})", parts.join("|")));
            }
        }
    }
    out
}
