//! 규칙 소스 파서
//!
//! YARA 문법의 부분집합을 재귀 하강 방식으로 파싱합니다.
//!
//! # 지원 문법
//!
//! ```text
//! import "pe"                                // 무시 (경고)
//! [private] [global] rule name [: tag ...] {
//!   meta:
//!     key = "string" | 123 | true
//!   strings:
//!     $a = "text" [nocase] [wide] [ascii] [fullword]
//!     $b = { 4D 5A ?? ?0 [2-4] ( 90 | CC ) }
//!     $c = /regex/is
//!   condition:
//!     $a and not #b > 2 or any of ($c*, $a) or filesize < 1MB or other_rule
//!     uint16(0) == 0x5A4D and uint32(uint32(0x3C)) == 0x4550
//!     $a at 0 or $b in (0..filesize - 16)
//! }
//! ```
//!
//! 모듈 필드(`pe.sections`), `@a[i]`, `!a[i]` 등 지원하지 않는 구문은
//! 해당 규칙만 실패시킵니다. [`parse_rules_recovering`]은 그런 규칙을
//! 건너뛰고 나머지 규칙을 반환합니다.

use crate::error::ScannerError;

use super::types::{
    CmpOp, Condition, HexToken, IntExpr, IntRead, MetaValue, Quantifier, RuleDef, StringDef,
    StringModifiers, StringPattern, StringSet,
};

/// 예약어 (규칙 이름으로 사용할 수 없음)
const RESERVED: &[&str] = &[
    "all",
    "and",
    "any",
    "ascii",
    "at",
    "condition",
    "false",
    "filesize",
    "fullword",
    "global",
    "import",
    "in",
    "include",
    "meta",
    "nocase",
    "none",
    "not",
    "of",
    "or",
    "private",
    "rule",
    "strings",
    "them",
    "true",
    "wide",
];

/// 파싱 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSource {
    /// 선언 순서의 규칙
    pub rules: Vec<RuleDef>,
    /// `import` 된 모듈 이름
    pub imports: Vec<String>,
}

/// 규칙 소스를 파싱합니다.
///
/// # Errors
///
/// 문법 오류 시 줄 번호와 함께 `ScannerError::RuleSyntax`를 반환합니다.
pub fn parse_rules(source: &str) -> Result<ParsedSource, ScannerError> {
    let (parsed, mut rejected) = Parser::new(source).file()?;
    if rejected.is_empty() {
        Ok(parsed)
    } else {
        Err(rejected.remove(0))
    }
}

/// 규칙 소스를 파싱하되, 오류가 있는 규칙은 건너뜁니다.
///
/// 건너뛴 규칙의 에러를 선언 순서로 함께 반환합니다.
///
/// # Errors
///
/// 규칙 경계를 찾을 수 없는 오류(닫히지 않은 주석, 규칙 밖의 알 수 없는 토큰 등)는
/// 파일 전체를 실패시킵니다.
pub fn parse_rules_recovering(
    source: &str,
) -> Result<(ParsedSource, Vec<ScannerError>), ScannerError> {
    Parser::new(source).file()
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn err(&self, reason: impl Into<String>) -> ScannerError {
        ScannerError::RuleSyntax {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) -> Result<(), ScannerError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return Err(self.err("unterminated block comment")),
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn eat(&mut self, b: u8) -> Result<bool, ScannerError> {
        self.skip_trivia()?;
        if self.peek() == Some(b) {
            self.bump();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ScannerError> {
        if self.eat(b)? {
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", b as char)))
        }
    }

    fn at_eof(&mut self) -> Result<bool, ScannerError> {
        self.skip_trivia()?;
        Ok(self.peek().is_none())
    }

    fn ident_len_at(&self, start: usize) -> usize {
        let rest = &self.src[start.min(self.src.len())..];
        match rest.first() {
            Some(b) if b.is_ascii_alphabetic() || *b == b'_' => rest
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                .count(),
            _ => 0,
        }
    }

    fn peek_ident(&mut self) -> Result<Option<&'a str>, ScannerError> {
        self.skip_trivia()?;
        let len = self.ident_len_at(self.pos);
        if len == 0 {
            return Ok(None);
        }
        let src: &'a [u8] = self.src;
        Ok(std::str::from_utf8(&src[self.pos..self.pos + len]).ok())
    }

    fn ident(&mut self) -> Result<String, ScannerError> {
        match self.peek_ident()? {
            Some(word) => {
                self.pos += word.len();
                Ok(word.to_owned())
            }
            None => Err(self.err("expected identifier")),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> Result<bool, ScannerError> {
        if self.peek_ident()? == Some(keyword) {
            self.pos += keyword.len();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// 식별자 뒤에 `b`가 오는지 소비 없이 확인합니다.
    fn ident_followed_by(&mut self, b: u8) -> Result<bool, ScannerError> {
        let Some(word) = self.peek_ident()? else {
            return Ok(false);
        };
        let (pos, line) = (self.pos, self.line);
        self.pos += word.len();
        let result = self.skip_trivia().map(|()| self.peek() == Some(b));
        self.pos = pos;
        self.line = line;
        result
    }

    fn integer(&mut self) -> Result<i64, ScannerError> {
        self.skip_trivia()?;
        let (radix, start) = if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            (16, self.pos + 2)
        } else {
            (10, self.pos)
        };
        let digits = self.src[start..]
            .iter()
            .take_while(|b| b.is_ascii_hexdigit() && (radix == 16 || b.is_ascii_digit()))
            .count();
        if digits == 0 {
            return Err(self.err("expected integer"));
        }
        let text = std::str::from_utf8(&self.src[start..start + digits])
            .map_err(|_| self.err("invalid integer"))?;
        let mut value =
            i64::from_str_radix(text, radix).map_err(|e| self.err(format!("invalid integer: {e}")))?;
        self.pos = start + digits;

        let suffix = &self.src[self.pos..];
        let multiplier = if suffix.starts_with(b"KB") {
            Some(1024)
        } else if suffix.starts_with(b"MB") {
            Some(1024 * 1024)
        } else {
            None
        };
        if let Some(m) = multiplier {
            self.pos += 2;
            value = value
                .checked_mul(m)
                .ok_or_else(|| self.err("integer overflow"))?;
        }
        Ok(value)
    }

    fn quoted(&mut self) -> Result<Vec<u8>, ScannerError> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.err("unterminated string")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => {
                    let escaped = match self.bump() {
                        Some(b'n') => b'\n',
                        Some(b'r') => b'\r',
                        Some(b't') => b'\t',
                        Some(b'"') => b'"',
                        Some(b'\\') => b'\\',
                        Some(b'x') => {
                            let hi = self.bump().and_then(hex_value);
                            let lo = self.bump().and_then(hex_value);
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => (hi << 4) | lo,
                                _ => return Err(self.err("invalid \\x escape")),
                            }
                        }
                        _ => return Err(self.err("invalid escape sequence")),
                    };
                    out.push(escaped);
                }
                Some(b) => out.push(b),
            }
        }
    }

    // --- 파일 / 규칙 ---

    fn file(mut self) -> Result<(ParsedSource, Vec<ScannerError>), ScannerError> {
        let mut parsed = ParsedSource::default();
        let mut rejected = Vec::new();
        while !self.at_eof()? {
            let start = (self.pos, self.line);
            let word = self.ident()?;
            match word.as_str() {
                "import" => {
                    let module = self.quoted()?;
                    parsed
                        .imports
                        .push(String::from_utf8_lossy(&module).into_owned());
                }
                "include" => {
                    let err = self.err("include directives are not supported");
                    self.quoted()?;
                    rejected.push(err);
                }
                "private" | "global" | "rule" => match self.rule_with_modifiers(&word) {
                    Ok(rule) => parsed.rules.push(rule),
                    Err(err) => {
                        if !self.skip_rule(start) {
                            return Err(err);
                        }
                        rejected.push(err);
                    }
                },
                other => return Err(self.err(format!("expected 'rule', found '{other}'"))),
            }
        }
        Ok((parsed, rejected))
    }

    fn rule_with_modifiers(&mut self, first: &str) -> Result<RuleDef, ScannerError> {
        let (mut private, mut global) = (false, false);
        let mut word = first.to_owned();
        loop {
            match word.as_str() {
                "private" => private = true,
                "global" => global = true,
                "rule" => break,
                other => {
                    return Err(self.err(format!("expected 'rule', found '{other}'")));
                }
            }
            word = self.ident()?;
        }
        self.rule(private, global)
    }

    /// `start`부터 규칙 본문을 닫는 `}`까지 건너뜁니다.
    ///
    /// 문자열, 주석, 정규식 안의 중괄호는 세지 않습니다. 끝을 찾지 못하면 `false`.
    fn skip_rule(&mut self, start: (usize, usize)) -> bool {
        (self.pos, self.line) = start;
        let mut depth = 0usize;
        let mut last = 0u8;
        while let Some(b) = self.bump() {
            match b {
                b'"' => {
                    while let Some(c) = self.bump() {
                        match c {
                            b'\\' => {
                                self.bump();
                            }
                            b'"' | b'\n' => break,
                            _ => {}
                        }
                    }
                }
                b'/' if self.peek() == Some(b'/') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                b'/' if self.peek() == Some(b'*') => {
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return false,
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
                // `$r = /.../` 정규식 리터럴
                b'/' if last == b'=' => {
                    while let Some(c) = self.bump() {
                        match c {
                            b'\\' => {
                                self.bump();
                            }
                            b'/' | b'\n' => break,
                            _ => {}
                        }
                    }
                }
                b'{' => depth += 1,
                b'}' => {
                    if depth <= 1 {
                        return true;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            if !b.is_ascii_whitespace() {
                last = b;
            }
        }
        false
    }

    fn rule(&mut self, private: bool, global: bool) -> Result<RuleDef, ScannerError> {
        let line = self.line;
        let name = self.ident()?;
        if RESERVED.contains(&name.as_str()) {
            return Err(self.err(format!("'{name}' is a reserved word")));
        }

        let mut tags = Vec::new();
        if self.eat(b':')? {
            while self.peek_ident()?.is_some() {
                tags.push(self.ident()?);
            }
        }
        self.expect(b'{')?;

        let mut meta = Vec::new();
        let mut strings = Vec::new();
        let mut condition = None;
        while !self.eat(b'}')? {
            let section = self.ident()?;
            self.expect(b':')?;
            match section.as_str() {
                "meta" => self.meta_section(&mut meta)?,
                "strings" => self.strings_section(&mut strings)?,
                "condition" => condition = Some(self.expr()?),
                other => {
                    return Err(self.err(format!("unexpected '{other}' in rule '{name}'")));
                }
            }
        }

        let condition = condition.ok_or_else(|| ScannerError::RuleSyntax {
            line,
            reason: format!("rule '{name}' has no condition"),
        })?;

        Ok(RuleDef {
            name,
            tags,
            private,
            global,
            meta,
            strings,
            condition,
            line,
        })
    }

    fn meta_section(&mut self, meta: &mut Vec<(String, MetaValue)>) -> Result<(), ScannerError> {
        while self.ident_followed_by(b'=')? {
            let key = self.ident()?;
            self.expect(b'=')?;
            self.skip_trivia()?;
            let value = match self.peek() {
                Some(b'"') => MetaValue::Str(String::from_utf8_lossy(&self.quoted()?).into_owned()),
                Some(b'-') => {
                    self.bump();
                    MetaValue::Int(-self.integer()?)
                }
                Some(b'0'..=b'9') => MetaValue::Int(self.integer()?),
                _ => match self.ident()?.as_str() {
                    "true" => MetaValue::Bool(true),
                    "false" => MetaValue::Bool(false),
                    other => {
                        return Err(self.err(format!("invalid meta value '{other}' for '{key}'")));
                    }
                },
            };
            meta.push((key, value));
        }
        Ok(())
    }

    fn string_id(&mut self) -> Result<String, ScannerError> {
        self.expect(b'$')?;
        let len = self.src[self.pos..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count();
        let mut id = String::from("$");
        id.push_str(
            std::str::from_utf8(&self.src[self.pos..self.pos + len])
                .map_err(|_| self.err("invalid string identifier"))?,
        );
        self.pos += len;
        if self.peek() == Some(b'*') {
            self.bump();
            id.push('*');
        }
        Ok(id)
    }

    fn strings_section(&mut self, strings: &mut Vec<StringDef>) -> Result<(), ScannerError> {
        loop {
            self.skip_trivia()?;
            if self.peek() != Some(b'$') {
                return Ok(());
            }
            let line = self.line;
            let mut id = self.string_id()?;
            if id.ends_with('*') {
                return Err(self.err(format!("invalid string identifier '{id}'")));
            }
            if id == "$" {
                id = format!("$anonymous{}", strings.len());
            }
            if strings.iter().any(|s: &StringDef| s.id == id) {
                return Err(self.err(format!("duplicated string identifier '{id}'")));
            }

            self.expect(b'=')?;
            self.skip_trivia()?;
            let pattern = match self.peek() {
                Some(b'"') => StringPattern::Text(self.quoted()?),
                Some(b'{') => {
                    self.bump();
                    StringPattern::Hex(self.hex_tokens(false)?)
                }
                Some(b'/') => self.regex_literal()?,
                _ => return Err(self.err(format!("expected string value for '{id}'"))),
            };
            let modifiers = self.string_modifiers(&id, &pattern)?;

            strings.push(StringDef {
                id,
                pattern,
                modifiers,
                line,
            });
        }
    }

    fn string_modifiers(
        &mut self,
        id: &str,
        pattern: &StringPattern,
    ) -> Result<StringModifiers, ScannerError> {
        let mut modifiers = StringModifiers::default();
        while let Some(word) = self.peek_ident()? {
            match word {
                "nocase" => modifiers.nocase = true,
                "wide" => modifiers.wide = true,
                "ascii" => modifiers.ascii = true,
                "fullword" => modifiers.fullword = true,
                "private" => {}
                _ => break,
            }
            self.pos += word.len();
        }

        let is_hex = matches!(pattern, StringPattern::Hex(_));
        if is_hex && modifiers != StringModifiers::default() {
            return Err(self.err(format!("modifiers are not allowed on hex string '{id}'")));
        }
        let is_regex = matches!(pattern, StringPattern::Regex { .. });
        if is_regex && (modifiers.wide || modifiers.fullword) {
            return Err(self.err(format!(
                "wide/fullword are not supported on regex string '{id}'"
            )));
        }
        Ok(modifiers)
    }

    fn hex_tokens(&mut self, in_alternative: bool) -> Result<Vec<HexToken>, ScannerError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            match self.peek() {
                None => return Err(self.err("unterminated hex string")),
                Some(b'}') if !in_alternative => {
                    self.bump();
                    break;
                }
                Some(b'|' | b')') if in_alternative => break,
                Some(b'[') => {
                    self.bump();
                    if tokens.is_empty() {
                        return Err(self.err("hex string cannot start with a jump"));
                    }
                    let min = self.jump_bound()?;
                    let max = if self.eat(b'-')? {
                        self.skip_trivia()?;
                        if self.peek() == Some(b']') {
                            None
                        } else {
                            Some(self.jump_bound()?)
                        }
                    } else {
                        Some(min)
                    };
                    if max.is_some_and(|max| max < min) {
                        return Err(self.err("invalid jump range"));
                    }
                    self.expect(b']')?;
                    tokens.push(HexToken::Jump { min, max });
                }
                Some(b'(') => {
                    self.bump();
                    let mut alternatives = Vec::new();
                    loop {
                        let seq = self.hex_tokens(true)?;
                        if seq.is_empty() {
                            return Err(self.err("empty hex alternative"));
                        }
                        alternatives.push(seq);
                        if !self.eat(b'|')? {
                            break;
                        }
                    }
                    self.expect(b')')?;
                    tokens.push(HexToken::Alternatives(alternatives));
                }
                Some(_) => {
                    let hi = self.bump();
                    let lo = self.bump();
                    tokens.push(self.hex_byte(hi, lo)?);
                }
            }
        }

        match (tokens.first(), tokens.last()) {
            (None, _) => Err(self.err("empty hex string")),
            (_, Some(HexToken::Jump { .. })) => Err(self.err("hex string cannot end with a jump")),
            _ => Ok(tokens),
        }
    }

    fn jump_bound(&mut self) -> Result<u32, ScannerError> {
        let value = self.integer()?;
        u32::try_from(value).map_err(|_| self.err("jump bound out of range"))
    }

    fn hex_byte(&self, hi: Option<u8>, lo: Option<u8>) -> Result<HexToken, ScannerError> {
        let nibble = |b: Option<u8>| -> Result<Option<u8>, ScannerError> {
            match b {
                Some(b'?') => Ok(None),
                Some(b) => hex_value(b)
                    .map(Some)
                    .ok_or_else(|| self.err(format!("invalid hex digit '{}'", b as char))),
                None => Err(self.err("unterminated hex string")),
            }
        };
        match (nibble(hi)?, nibble(lo)?) {
            (Some(h), Some(l)) => Ok(HexToken::Byte((h << 4) | l)),
            (Some(h), None) => Ok(HexToken::Masked {
                value: h << 4,
                mask: 0xF0,
            }),
            (None, Some(l)) => Ok(HexToken::Masked {
                value: l,
                mask: 0x0F,
            }),
            (None, None) => Ok(HexToken::Masked { value: 0, mask: 0 }),
        }
    }

    fn regex_literal(&mut self) -> Result<StringPattern, ScannerError> {
        self.bump(); // '/'
        let mut raw = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.err("unterminated regular expression")),
                Some(b'/') => break,
                Some(b'\\') if self.peek() == Some(b'/') => {
                    self.bump();
                    raw.push(b'/');
                }
                Some(b'\\') => {
                    raw.push(b'\\');
                    match self.bump() {
                        Some(b'\n') | None => {
                            return Err(self.err("unterminated regular expression"));
                        }
                        Some(b) => raw.push(b),
                    }
                }
                Some(b) => raw.push(b),
            }
        }
        if raw.is_empty() {
            return Err(self.err("empty regular expression"));
        }

        let (mut case_insensitive, mut dot_all) = (false, false);
        while let Some(flag) = self.peek() {
            match flag {
                b'i' => case_insensitive = true,
                b's' => dot_all = true,
                _ => break,
            }
            self.bump();
        }

        let pattern =
            String::from_utf8(raw).map_err(|_| self.err("regular expression is not valid UTF-8"))?;
        Ok(StringPattern::Regex {
            pattern,
            case_insensitive,
            dot_all,
        })
    }

    // --- 조건식 ---

    fn expr(&mut self) -> Result<Condition, ScannerError> {
        let mut items = vec![self.and_expr()?];
        while self.eat_keyword("or")? {
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::Or(items)
        })
    }

    fn and_expr(&mut self) -> Result<Condition, ScannerError> {
        let mut items = vec![self.not_expr()?];
        while self.eat_keyword("and")? {
            items.push(self.not_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Condition::And(items)
        })
    }

    fn not_expr(&mut self) -> Result<Condition, ScannerError> {
        if self.eat_keyword("not")? {
            Ok(Condition::Not(Box::new(self.not_expr()?)))
        } else {
            self.primary()
        }
    }

    fn primary(&mut self) -> Result<Condition, ScannerError> {
        self.skip_trivia()?;
        match self.peek() {
            Some(b'(') => {
                self.bump();
                let inner = self.expr()?;
                self.expect(b')')?;
                Ok(inner)
            }
            Some(b'$') => {
                let id = self.string_id()?;
                if id.ends_with('*') || id == "$" {
                    return Err(self.err(format!("'{id}' can only be used in a string set")));
                }
                if self.eat_keyword("at")? {
                    let offset = self.int_expr()?;
                    return Ok(Condition::StringAt { id, offset });
                }
                if self.eat_keyword("in")? {
                    self.expect(b'(')?;
                    let start = self.int_expr()?;
                    self.expect(b'.')?;
                    self.expect(b'.')?;
                    let end = self.int_expr()?;
                    self.expect(b')')?;
                    return Ok(Condition::StringIn { id, start, end });
                }
                Ok(Condition::StringRef(id))
            }
            Some(b'#') => {
                let lhs = self.int_expr()?;
                self.comparison(lhs)
            }
            Some(b'0'..=b'9') => {
                let n = self.integer()?;
                if self.eat_keyword("of")? {
                    let set = self.string_set()?;
                    let n = u64::try_from(n).map_err(|_| self.err("negative quantifier"))?;
                    return Ok(Condition::Of {
                        quantifier: Quantifier::AtLeast(n),
                        set,
                    });
                }
                let lhs = self.int_tail(IntExpr::Literal(n))?;
                self.comparison(lhs)
            }
            Some(c @ (b'@' | b'!')) => Err(self.err(format!(
                "'{}' string operators are not supported",
                c as char
            ))),
            _ => {
                let word = self.ident()?;
                self.reject_module_access(&word)?;
                match word.as_str() {
                    "true" => Ok(Condition::Bool(true)),
                    "false" => Ok(Condition::Bool(false)),
                    "any" | "all" | "none" => {
                        if !self.eat_keyword("of")? {
                            return Err(self.err(format!("expected 'of' after '{word}'")));
                        }
                        let quantifier = match word.as_str() {
                            "any" => Quantifier::Any,
                            "all" => Quantifier::All,
                            _ => Quantifier::None,
                        };
                        let set = self.string_set()?;
                        Ok(Condition::Of { quantifier, set })
                    }
                    "filesize" => {
                        let lhs = self.int_tail(IntExpr::Filesize)?;
                        self.comparison(lhs)
                    }
                    _ if IntRead::from_name(&word).is_some() => {
                        let read = self.int_read(&word)?;
                        let lhs = self.int_tail(read)?;
                        self.comparison(lhs)
                    }
                    other if RESERVED.contains(&other) => {
                        Err(self.err(format!("unexpected '{other}' in condition")))
                    }
                    _ => Ok(Condition::RuleRef(word)),
                }
            }
        }
    }

    /// `pe.number_of_sections` 같은 모듈 접근은 지원하지 않습니다.
    fn reject_module_access(&self, word: &str) -> Result<(), ScannerError> {
        if self.peek() == Some(b'.') && self.peek_at(1) != Some(b'.') {
            Err(self.err(format!("module '{word}' is not supported")))
        } else {
            Ok(())
        }
    }

    fn comparison(&mut self, lhs: IntExpr) -> Result<Condition, ScannerError> {
        let op = self.cmp_op()?;
        let rhs = self.int_expr()?;
        Ok(Condition::Compare { lhs, op, rhs })
    }

    fn int_expr(&mut self) -> Result<IntExpr, ScannerError> {
        let term = self.int_term()?;
        self.int_tail(term)
    }

    /// `lhs` 뒤의 `+`/`-` 연산을 왼쪽 결합으로 이어 붙입니다.
    fn int_tail(&mut self, mut lhs: IntExpr) -> Result<IntExpr, ScannerError> {
        loop {
            self.skip_trivia()?;
            match self.peek() {
                Some(b'+') => {
                    self.bump();
                    lhs = IntExpr::Add(Box::new(lhs), Box::new(self.int_term()?));
                }
                Some(b'-') => {
                    self.bump();
                    lhs = IntExpr::Sub(Box::new(lhs), Box::new(self.int_term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn int_term(&mut self) -> Result<IntExpr, ScannerError> {
        self.skip_trivia()?;
        match self.peek() {
            Some(b'0'..=b'9') => Ok(IntExpr::Literal(self.integer()?)),
            Some(b'-') => {
                self.bump();
                Ok(IntExpr::Literal(-self.integer()?))
            }
            Some(b'#') => {
                self.bump();
                let len = self.ident_len_at(self.pos);
                if len == 0 {
                    return Err(self.err("expected string identifier after '#'"));
                }
                let name = std::str::from_utf8(&self.src[self.pos..self.pos + len])
                    .map_err(|_| self.err("invalid string identifier"))?;
                let id = format!("${name}");
                self.pos += len;
                Ok(IntExpr::Count(id))
            }
            Some(c @ (b'@' | b'!')) => Err(self.err(format!(
                "'{}' string operators are not supported",
                c as char
            ))),
            _ => {
                let word = self.ident()?;
                self.reject_module_access(&word)?;
                if word == "filesize" {
                    Ok(IntExpr::Filesize)
                } else if IntRead::from_name(&word).is_some() {
                    self.int_read(&word)
                } else {
                    Err(self.err(format!("expected integer expression, found '{word}'")))
                }
            }
        }
    }

    /// 이름을 소비한 뒤 `(offset)`을 파싱합니다.
    fn int_read(&mut self, name: &str) -> Result<IntExpr, ScannerError> {
        let read = IntRead::from_name(name)
            .ok_or_else(|| self.err(format!("unknown function '{name}'")))?;
        self.expect(b'(')?;
        let offset = self.int_expr()?;
        self.expect(b')')?;
        Ok(IntExpr::Read {
            read,
            offset: Box::new(offset),
        })
    }

    fn cmp_op(&mut self) -> Result<CmpOp, ScannerError> {
        self.skip_trivia()?;
        let (op, len) = match (self.peek(), self.peek_at(1)) {
            (Some(b'='), Some(b'=')) => (CmpOp::Eq, 2),
            (Some(b'!'), Some(b'=')) => (CmpOp::Ne, 2),
            (Some(b'<'), Some(b'=')) => (CmpOp::Le, 2),
            (Some(b'>'), Some(b'=')) => (CmpOp::Ge, 2),
            (Some(b'<'), _) => (CmpOp::Lt, 1),
            (Some(b'>'), _) => (CmpOp::Gt, 1),
            _ => return Err(self.err("expected comparison operator")),
        };
        self.pos += len;
        Ok(op)
    }

    fn string_set(&mut self) -> Result<StringSet, ScannerError> {
        if self.eat_keyword("them")? {
            return Ok(StringSet::Them);
        }
        self.expect(b'(')?;
        let mut patterns = Vec::new();
        loop {
            self.skip_trivia()?;
            patterns.push(self.string_id()?);
            if !self.eat(b',')? {
                break;
            }
        }
        self.expect(b')')?;
        Ok(StringSet::Patterns(patterns))
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(src: &str) -> RuleDef {
        let mut parsed = parse_rules(src).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        parsed.rules.remove(0)
    }

    #[test]
    fn parses_full_rule() {
        let rule = parse_one(
            r#"
            // leading comment
            rule Eicar_Test : test malware {
                meta:
                    description = "EICAR test file"
                    severity = "high"
                    score = 90
                    enabled = true
                strings:
                    $a = "X5O!P%@AP" nocase
                    $b = { 58 35 4F ?? [1-2] ( 21 | 22 ) }
                    $c = /STANDARD-ANTIVIRUS-TEST-FILE/i
                condition:
                    /* block comment */
                    $a and (#b >= 1 or any of ($c*)) and filesize < 1KB
            }
            "#,
        );
        assert_eq!(rule.name, "Eicar_Test");
        assert_eq!(rule.tags, vec!["test", "malware"]);
        assert_eq!(rule.meta.len(), 4);
        assert_eq!(rule.meta[2], ("score".to_owned(), MetaValue::Int(90)));
        assert_eq!(rule.strings.len(), 3);
        assert!(rule.strings[0].modifiers.nocase);
        assert!(matches!(
            rule.strings[2].pattern,
            StringPattern::Regex {
                case_insensitive: true,
                dot_all: false,
                ..
            }
        ));
        assert!(matches!(rule.condition, Condition::And(ref items) if items.len() == 3));
    }

    #[test]
    fn parses_hex_tokens() {
        let rule = parse_one("rule h { strings: $h = { 4D ?A B? ?? [4] [2-] } condition: $h }");
        let StringPattern::Hex(tokens) = &rule.strings[0].pattern else {
            panic!("expected hex pattern");
        };
        assert_eq!(tokens[0], HexToken::Byte(0x4D));
        assert_eq!(
            tokens[1],
            HexToken::Masked {
                value: 0x0A,
                mask: 0x0F
            }
        );
        assert_eq!(
            tokens[2],
            HexToken::Masked {
                value: 0xB0,
                mask: 0xF0
            }
        );
        assert_eq!(tokens[3], HexToken::Masked { value: 0, mask: 0 });
        assert_eq!(tokens[4], HexToken::Jump { min: 4, max: Some(4) });
        // 끝이 점프이므로 거부되어야 함
        assert!(parse_rules("rule x { strings: $h = { 4D [2-] } condition: $h }").is_err());
    }

    #[test]
    fn parses_private_global_and_imports() {
        let parsed = parse_rules(
            r#"
            import "pe"
            private global rule base { condition: filesize > 0 }
            rule uses_base { condition: base }
            "#,
        )
        .unwrap();
        assert_eq!(parsed.imports, vec!["pe"]);
        assert!(parsed.rules[0].private);
        assert!(parsed.rules[0].global);
        assert_eq!(
            parsed.rules[1].condition,
            Condition::RuleRef("base".to_owned())
        );
    }

    #[test]
    fn parses_text_escapes() {
        let rule = parse_one(r#"rule e { strings: $a = "a\"b\x41\\" condition: $a }"#);
        assert_eq!(
            rule.strings[0].pattern,
            StringPattern::Text(b"a\"bA\\".to_vec())
        );
    }

    #[test]
    fn parses_quantifiers() {
        let rule = parse_one(
            r#"rule q { strings: $a = "x" $b = "y" condition: 2 of them and none of ($a) }"#,
        );
        let Condition::And(items) = rule.condition else {
            panic!("expected and");
        };
        assert_eq!(
            items[0],
            Condition::Of {
                quantifier: Quantifier::AtLeast(2),
                set: StringSet::Them
            }
        );
        assert_eq!(
            items[1],
            Condition::Of {
                quantifier: Quantifier::None,
                set: StringSet::Patterns(vec!["$a".to_owned()])
            }
        );
    }

    #[test]
    fn filesize_units() {
        let rule = parse_one("rule f { condition: filesize <= 2MB }");
        assert_eq!(
            rule.condition,
            Condition::Compare {
                lhs: IntExpr::Filesize,
                op: CmpOp::Le,
                rhs: IntExpr::Literal(2 * 1024 * 1024),
            }
        );
    }

    #[test]
    fn parses_integer_reads_and_offsets() {
        let rule = parse_one(
            r#"rule pe_like {
                strings: $mz = "MZ" $sig = "PE"
                condition:
                    uint16(0) == 0x5A4D and
                    uint32(uint32(0x3C)) == 0x00004550 and
                    $mz at 0 and
                    $sig in (0x40..filesize - 2)
            }"#,
        );
        let Condition::And(items) = rule.condition else {
            panic!("expected and");
        };
        assert_eq!(items.len(), 4);
        let u16le = IntRead::from_name("uint16").unwrap();
        assert_eq!(
            items[0],
            Condition::Compare {
                lhs: IntExpr::Read {
                    read: u16le,
                    offset: Box::new(IntExpr::Literal(0)),
                },
                op: CmpOp::Eq,
                rhs: IntExpr::Literal(0x5A4D),
            }
        );
        assert!(matches!(
            &items[1],
            Condition::Compare { lhs: IntExpr::Read { offset, .. }, .. }
                if matches!(**offset, IntExpr::Read { .. })
        ));
        assert_eq!(
            items[2],
            Condition::StringAt {
                id: "$mz".to_owned(),
                offset: IntExpr::Literal(0),
            }
        );
        assert_eq!(
            items[3],
            Condition::StringIn {
                id: "$sig".to_owned(),
                start: IntExpr::Literal(0x40),
                end: IntExpr::Sub(
                    Box::new(IntExpr::Filesize),
                    Box::new(IntExpr::Literal(2)),
                ),
            }
        );
    }

    #[test]
    fn count_comparisons_accept_expressions() {
        let rule = parse_one(r#"rule c { strings: $a = "x" condition: #a >= 2 + 1 }"#);
        assert_eq!(
            rule.condition,
            Condition::Compare {
                lhs: IntExpr::Count("$a".to_owned()),
                op: CmpOp::Ge,
                rhs: IntExpr::Add(
                    Box::new(IntExpr::Literal(2)),
                    Box::new(IntExpr::Literal(1)),
                ),
            }
        );
    }

    #[test]
    fn module_fields_fail_only_their_rule() {
        let source = r#"
            import "pe"
            rule uses_pe { condition: pe.number_of_sections > 3 }
            rule first_byte { strings: $a = "a{b}" $r = /x{2}\}/ condition: $a at pe.entry_point or $r }
            rule kept { strings: $k = "KEEP" condition: $k }
        "#;
        assert!(parse_rules(source).is_err());

        let (parsed, rejected) = parse_rules_recovering(source).unwrap();
        assert_eq!(rejected.len(), 2);
        assert!(rejected[0].to_string().contains("module 'pe'"));
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].name, "kept");
    }

    #[test]
    fn recovery_reports_each_broken_rule() {
        let source = "rule a { condition: true }\n\
                      rule b { strings: $x = \"x\" condition: @x[1] == 0 }\n\
                      rule c { condition: $x at }\n\
                      rule d { condition: false }";
        let (parsed, rejected) = parse_rules_recovering(source).unwrap();
        let names: Vec<&str> = parsed.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);
        assert_eq!(rejected.len(), 2);
    }

    #[test]
    fn unterminated_rule_is_not_recoverable() {
        assert!(parse_rules_recovering("rule ok { condition: true }\nrule open { condition: ").is_err());
    }

    #[test]
    fn missing_condition_is_error() {
        let err = parse_rules("rule nocond { strings: $a = \"x\" }").unwrap_err();
        assert!(err.to_string().contains("no condition"));
    }

    #[test]
    fn syntax_error_reports_line() {
        let err = parse_rules("rule ok { condition: true }\n\nrule bad {\n condition: $a ==\n}")
            .unwrap_err();
        match err {
            ScannerError::RuleSyntax { line, .. } => assert!(line >= 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reserved_rule_name_is_error() {
        assert!(parse_rules("rule them { condition: true }").is_err());
    }

    #[test]
    fn duplicated_string_is_error() {
        let err = parse_rules(r#"rule d { strings: $a = "x" $a = "y" condition: $a }"#).unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn include_is_rejected() {
        assert!(parse_rules(r#"include "other.yar""#).is_err());
    }

    #[test]
    fn empty_source_has_no_rules() {
        let parsed = parse_rules("  // nothing here\n").unwrap();
        assert!(parsed.rules.is_empty());
    }
}
