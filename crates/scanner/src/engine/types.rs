//! 규칙 구문 트리
//!
//! 파서가 생성하고 매처가 컴파일하는 중간 표현입니다.

use std::fmt;

/// 파싱된 규칙 하나
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDef {
    /// 규칙 이름
    pub name: String,
    /// 태그
    pub tags: Vec<String>,
    /// `private` 규칙은 다른 규칙의 조건에서만 쓰이고 결과로 보고되지 않음
    pub private: bool,
    /// `global` 규칙이 거짓이면 다른 모든 규칙이 매칭되지 않음
    pub global: bool,
    /// 메타데이터 (선언 순서)
    pub meta: Vec<(String, MetaValue)>,
    /// 문자열 정의
    pub strings: Vec<StringDef>,
    /// 조건식
    pub condition: Condition,
    /// 선언 위치 (1부터 시작)
    pub line: usize,
}

/// 메타데이터 값
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// 문자열 정의 (`$id = ...`)
#[derive(Debug, Clone, PartialEq)]
pub struct StringDef {
    /// `$`를 포함한 식별자
    pub id: String,
    /// 패턴
    pub pattern: StringPattern,
    /// 수식어
    pub modifiers: StringModifiers,
    /// 선언 위치
    pub line: usize,
}

/// 문자열 패턴 종류
#[derive(Debug, Clone, PartialEq)]
pub enum StringPattern {
    /// 텍스트 (`"..."`, 이스케이프 해제 후 바이트)
    Text(Vec<u8>),
    /// 16진 패턴 (`{ 4D 5A ?? [2-4] }`)
    Hex(Vec<HexToken>),
    /// 정규식 (`/.../is`)
    Regex {
        pattern: String,
        case_insensitive: bool,
        dot_all: bool,
    },
}

/// 16진 패턴 토큰
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexToken {
    /// 고정 바이트
    Byte(u8),
    /// 니블 와일드카드 (`?A`, `A?`, `??`). `mask`에 포함된 비트만 비교
    Masked { value: u8, mask: u8 },
    /// 점프 (`[n]`, `[n-m]`, `[n-]`)
    Jump { min: u32, max: Option<u32> },
    /// 대안 (`( AA | BB CC )`)
    Alternatives(Vec<Vec<HexToken>>),
}

/// 텍스트 문자열 수식어
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringModifiers {
    pub nocase: bool,
    pub wide: bool,
    pub ascii: bool,
    pub fullword: bool,
}

/// 비교 연산자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// `lhs OP rhs`를 평가합니다.
    pub fn apply(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }
}

/// `... of ...` 수량자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Any,
    All,
    None,
    AtLeast(u64),
}

/// `of` 대상 문자열 집합
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringSet {
    /// 규칙의 모든 문자열
    Them,
    /// 식별자 목록, `$a*` 형태의 접두어 와일드카드 허용
    Patterns(Vec<String>),
}

/// 정수 읽기 함수 (`uint16(off)`, `int32be(off)` ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRead {
    /// 읽을 바이트 수 (1, 2, 4)
    pub width: usize,
    pub signed: bool,
    pub big_endian: bool,
}

impl IntRead {
    /// 함수 이름을 해석합니다. 읽기 함수가 아니면 `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (signed, rest) = if let Some(rest) = name.strip_prefix("uint") {
            (false, rest)
        } else if let Some(rest) = name.strip_prefix("int") {
            (true, rest)
        } else {
            return None;
        };
        let (bits, big_endian) = match rest.strip_suffix("be") {
            Some(bits) => (bits, true),
            None => (rest, false),
        };
        let width = match bits {
            "8" => 1,
            "16" => 2,
            "32" => 4,
            _ => return None,
        };
        Some(Self {
            width,
            signed,
            big_endian,
        })
    }

    /// `offset`에서 정수를 읽습니다. 범위를 벗어나면 `None` (정의되지 않음).
    pub fn read(self, data: &[u8], offset: usize) -> Option<i64> {
        let end = offset.checked_add(self.width)?;
        let bytes = data.get(offset..end)?;
        let fold = |acc: u32, b: &u8| (acc << 8) | u32::from(*b);
        let raw = if self.big_endian {
            bytes.iter().fold(0, fold)
        } else {
            bytes.iter().rev().fold(0, fold)
        };
        Some(match (self.signed, self.width) {
            (false, _) => i64::from(raw),
            (true, 1) => i64::from(raw as u8 as i8),
            (true, 2) => i64::from(raw as u16 as i16),
            (true, _) => i64::from(raw as i32),
        })
    }
}

/// 정수 식
#[derive(Debug, Clone, PartialEq)]
pub enum IntExpr {
    Literal(i64),
    Filesize,
    /// `#a`
    Count(String),
    /// `uint16(0)`
    Read { read: IntRead, offset: Box<IntExpr> },
    Add(Box<IntExpr>, Box<IntExpr>),
    Sub(Box<IntExpr>, Box<IntExpr>),
}

impl IntExpr {
    fn collect_string_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
        match self {
            Self::Count(id) => refs.push(id),
            Self::Read { offset, .. } => offset.collect_string_refs(refs),
            Self::Add(lhs, rhs) | Self::Sub(lhs, rhs) => {
                lhs.collect_string_refs(refs);
                rhs.collect_string_refs(refs);
            }
            Self::Literal(_) | Self::Filesize => {}
        }
    }
}

/// 조건식
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Bool(bool),
    /// `$a`
    StringRef(String),
    /// `$a at 0x100`
    StringAt { id: String, offset: IntExpr },
    /// `$a in (0..1024)`
    StringIn {
        id: String,
        start: IntExpr,
        end: IntExpr,
    },
    /// `#a > 2`, `filesize < 1MB`, `uint16(0) == 0x5A4D`
    Compare {
        lhs: IntExpr,
        op: CmpOp,
        rhs: IntExpr,
    },
    /// `any of them`, `2 of ($a*, $b)`
    Of {
        quantifier: Quantifier,
        set: StringSet,
    },
    /// 앞서 선언된 규칙 참조
    RuleRef(String),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// 조건식이 참조하는 문자열 식별자와 `them` 사용 여부를 수집합니다.
    pub fn collect_string_refs<'a>(&'a self, refs: &mut Vec<&'a str>, uses_them: &mut bool) {
        match self {
            Self::StringRef(id) => refs.push(id),
            Self::StringAt { id, offset } => {
                refs.push(id);
                offset.collect_string_refs(refs);
            }
            Self::StringIn { id, start, end } => {
                refs.push(id);
                start.collect_string_refs(refs);
                end.collect_string_refs(refs);
            }
            Self::Compare { lhs, rhs, .. } => {
                lhs.collect_string_refs(refs);
                rhs.collect_string_refs(refs);
            }
            Self::Of { set, .. } => match set {
                StringSet::Them => *uses_them = true,
                StringSet::Patterns(patterns) => refs.extend(patterns.iter().map(String::as_str)),
            },
            Self::Not(inner) => inner.collect_string_refs(refs, uses_them),
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_string_refs(refs, uses_them);
                }
            }
            Self::Bool(_) | Self::RuleRef(_) => {}
        }
    }
}
