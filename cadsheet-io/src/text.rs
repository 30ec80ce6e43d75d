//! DXF 文字内容的解码：控制码、`\U+XXXX` 转义与 `%%` 特殊字符。

/// 单行文字（TEXT / ATTRIB）的解码。
pub(crate) fn decode_inline_text(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.peek().copied() {
                Some('U') | Some('u') => {
                    chars.next();
                    push_unicode_escape(&mut chars, &mut result);
                }
                Some('P') | Some('p') => {
                    chars.next();
                    result.push('\n');
                }
                Some('~') => {
                    chars.next();
                    result.push(' ');
                }
                Some('\\') => {
                    chars.next();
                    result.push('\\');
                }
                _ => result.push('\\'),
            },
            '%' if chars.peek() == Some(&'%') => {
                chars.next();
                push_percent_code(&mut chars, &mut result);
            }
            _ => result.push(ch),
        }
    }
    result
}

/// MTEXT 内容解码：去掉格式块，只保留可见文字。
pub(crate) fn decode_mtext_content(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' | '}' => {}
            '\\' => match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('{') => result.push('{'),
                Some('}') => result.push('}'),
                Some('U') | Some('u') => push_unicode_escape(&mut chars, &mut result),
                // 带参数的格式码，一直到分号
                Some('f') | Some('F') | Some('H') | Some('h') | Some('W') | Some('w')
                | Some('C') | Some('c') | Some('A') | Some('a') | Some('T') | Some('t')
                | Some('Q') | Some('q') => {
                    for next in chars.by_ref() {
                        if next == ';' {
                            break;
                        }
                    }
                }
                Some('S') | Some('s') => {
                    // 堆叠文字 a^b / a#b 输出为 a/b
                    for next in chars.by_ref() {
                        match next {
                            ';' => break,
                            '^' | '#' => result.push('/'),
                            other => result.push(other),
                        }
                    }
                }
                // 下划线、删除线等开关
                Some('L') | Some('l') | Some('O') | Some('o') | Some('K') | Some('k') => {}
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            },
            '%' if chars.peek() == Some(&'%') => {
                chars.next();
                push_percent_code(&mut chars, &mut result);
            }
            _ => result.push(ch),
        }
    }
    result
}

fn push_percent_code(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String) {
    match chars.next() {
        Some('d') | Some('D') => out.push('°'),
        Some('p') | Some('P') => out.push('±'),
        Some('c') | Some('C') => out.push('⌀'),
        Some('%') => out.push('%'),
        // %%u / %%o 只是下划线与上划线开关
        Some('u') | Some('U') | Some('o') | Some('O') => {}
        Some(other) => {
            out.push_str("%%");
            out.push(other);
        }
        None => out.push_str("%%"),
    }
}

fn push_unicode_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String) {
    if chars.peek() != Some(&'+') {
        out.push_str("\\U");
        return;
    }
    chars.next();
    let mut hex = String::with_capacity(4);
    while hex.len() < 4 {
        match chars.peek() {
            Some(c) if c.is_ascii_hexdigit() => {
                hex.push(*c);
                chars.next();
            }
            _ => break,
        }
    }
    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
        Some(decoded) if hex.len() == 4 => out.push(decoded),
        _ => {
            out.push_str("\\U+");
            out.push_str(&hex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_text_decodes_escapes_and_specials() {
        assert_eq!(decode_inline_text("\\U+4E2D\\U+56FD"), "中国");
        assert_eq!(decode_inline_text("%%c50 %%p0.1 45%%d"), "⌀50 ±0.1 45°");
        assert_eq!(decode_inline_text("%%u第1张"), "第1张");
    }

    #[test]
    fn mtext_strips_formatting_blocks() {
        let raw = "{\\fSimSun|b0|i0|c134;中国核电}\\P{\\H2.5x;CNPE}";
        assert_eq!(decode_mtext_content(raw), "中国核电\nCNPE");
        assert_eq!(decode_mtext_content("1\\S1^2;"), "11/2");
        assert_eq!(decode_mtext_content("a\\~b"), "a b");
    }
}
