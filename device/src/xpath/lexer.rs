use super::XPathError;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Tok {
    Name(String),
    Literal(String),
    Number(f64),
    Slash,
    DoubleSlash,
    Dot,
    DoubleDot,
    At,
    Star,
    Pipe,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    DoubleColon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Mul,
    And,
    Or,
    Div,
    Mod,
}

impl Tok {
    /// After one of these, `*` and `and`/`or`/`div`/`mod` are operators.
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            Tok::Name(_)
                | Tok::Literal(_)
                | Tok::Number(_)
                | Tok::Star
                | Tok::Dot
                | Tok::DoubleDot
                | Tok::RParen
                | Tok::RBracket
        )
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

pub(super) fn tokenize(input: &str) -> Result<Vec<Tok>, XPathError> {
    let chars: Vec<char> = input.chars().collect();
    let mut toks: Vec<Tok> = Vec::new();
    let mut i = 0;

    let syntax = |reason: String| XPathError::syntax(input, reason);

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let operator_position = toks.last().is_some_and(Tok::ends_operand);

        let tok = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '/' if next == Some('/') => {
                i += 1;
                Tok::DoubleSlash
            }
            '/' => Tok::Slash,
            '.' if next == Some('.') => {
                i += 1;
                Tok::DoubleDot
            }
            '.' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let (n, end) = read_number(&chars, i).map_err(syntax)?;
                i = end;
                toks.push(Tok::Number(n));
                continue;
            }
            '.' => Tok::Dot,
            '@' => Tok::At,
            '*' if operator_position => Tok::Mul,
            '*' => Tok::Star,
            '|' => Tok::Pipe,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            ',' => Tok::Comma,
            ':' if next == Some(':') => {
                i += 1;
                Tok::DoubleColon
            }
            '=' => Tok::Eq,
            '!' if next == Some('=') => {
                i += 1;
                Tok::Ne
            }
            '<' if next == Some('=') => {
                i += 1;
                Tok::Le
            }
            '<' => Tok::Lt,
            '>' if next == Some('=') => {
                i += 1;
                Tok::Ge
            }
            '>' => Tok::Gt,
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '\'' | '"' => {
                let start = i + 1;
                let Some(len) = chars[start..].iter().position(|&q| q == c) else {
                    return Err(syntax("unterminated string literal".into()));
                };
                i = start + len + 1;
                toks.push(Tok::Literal(chars[start..start + len].iter().collect()));
                continue;
            }
            c if c.is_ascii_digit() => {
                let (n, end) = read_number(&chars, i).map_err(syntax)?;
                i = end;
                toks.push(Tok::Number(n));
                continue;
            }
            c if is_name_start(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                // prefixed names (ns:local, ns:*) stay one token
                if chars.get(i) == Some(&':')
                    && chars
                        .get(i + 1)
                        .is_some_and(|&n| is_name_start(n) || n == '*')
                {
                    i += 1;
                    if chars[i] == '*' {
                        i += 1;
                    } else {
                        while i < chars.len() && is_name_char(chars[i]) {
                            i += 1;
                        }
                    }
                }
                let name: String = chars[start..i].iter().collect();
                let tok = match name.as_str() {
                    "and" if operator_position => Tok::And,
                    "or" if operator_position => Tok::Or,
                    "div" if operator_position => Tok::Div,
                    "mod" if operator_position => Tok::Mod,
                    _ => Tok::Name(name),
                };
                toks.push(tok);
                continue;
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        };
        toks.push(tok);
        i += 1;
    }
    Ok(toks)
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), String> {
    let mut end = start;
    let mut seen_dot = false;
    while end < chars.len() {
        match chars[end] {
            '0'..='9' => {}
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    let text: String = chars[start..end].iter().collect();
    text.parse()
        .map(|n| (n, end))
        .map_err(|_| format!("bad number '{text}'"))
}
