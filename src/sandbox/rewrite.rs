/// Cooperative cancellation instrumentation
///
/// The interpreter cannot be preempted from another thread, so before
/// compilation every block entry and every `goto` gets a call to the interrupt
/// check. The scanner understands just enough Lua lexing (strings, long
/// brackets, comments) to never inject inside literal text. Line numbers are
/// preserved: injections never add newlines and the local alias lives on line 1.

const BLOCK_KEYWORDS: [&str; 4] = ["do", "then", "else", "repeat"];

/// Name of the host function the injected calls go through
pub const INTERRUPT_CHECK: &str = "__check_interrupt";

/// Instrument a script with interrupt checks at every block entry
pub fn instrument(source: &str) -> String {
    let injection = format!(" {}();", INTERRUPT_CHECK);
    let points = injection_points(source);

    let mut out = String::with_capacity(source.len() + points.len() * injection.len() + 64);
    // Bound as a chunk local so scripts cannot rebind the check
    out.push_str(&format!("local {0} = {0}; ", INTERRUPT_CHECK));

    let mut last = 0;
    for point in points {
        out.push_str(&source[last..point]);
        out.push_str(&injection);
        last = point;
    }
    out.push_str(&source[last..]);
    out
}

/// Byte offsets right after each block-opening token and right before each `goto`
fn injection_points(source: &str) -> Vec<usize> {
    let bytes = source.as_bytes();
    let mut points = Vec::new();
    let mut i = 0;
    // `function` seen, waiting for its parameter list to open / close
    let mut awaiting_params = false;
    let mut in_params = false;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            i = skip_comment(bytes, i + 2);
            continue;
        }

        if c == b'"' || c == b'\'' {
            i = skip_quoted(bytes, i);
            continue;
        }

        if c == b'[' {
            if let Some(level) = long_bracket_level(bytes, i) {
                i = skip_long_bracket(bytes, i, level);
                continue;
            }
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &source[start..i];
            if word == "function" {
                awaiting_params = true;
            } else if BLOCK_KEYWORDS.contains(&word) {
                points.push(i);
            } else if word == "goto" {
                // Back-edges through labels never enter a new block
                points.push(start);
            }
            continue;
        }

        if c.is_ascii_digit() {
            // Numerals, including hex and exponents, never hold keywords
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            continue;
        }

        if c == b'(' && awaiting_params {
            awaiting_params = false;
            in_params = true;
        } else if c == b')' && in_params {
            in_params = false;
            points.push(i + 1);
        }

        i += 1;
    }

    points
}

/// `[` followed by `=`* and `[` opens a long bracket of that level
fn long_bracket_level(bytes: &[u8], start: usize) -> Option<usize> {
    let mut j = start + 1;
    let mut level = 0;
    while bytes.get(j) == Some(&b'=') {
        level += 1;
        j += 1;
    }
    (bytes.get(j) == Some(&b'[')).then_some(level)
}

fn skip_long_bracket(bytes: &[u8], start: usize, level: usize) -> usize {
    let mut i = start + level + 2;
    while i < bytes.len() {
        if bytes[i] == b']' {
            let mut j = i + 1;
            let mut closing = 0;
            while bytes.get(j) == Some(&b'=') {
                closing += 1;
                j += 1;
            }
            if closing == level && bytes.get(j) == Some(&b']') {
                return j + 1;
            }
        }
        i += 1;
    }
    bytes.len()
}

fn skip_comment(bytes: &[u8], start: usize) -> usize {
    if bytes.get(start) == Some(&b'[') {
        if let Some(level) = long_bracket_level(bytes, start) {
            return skip_long_bracket(bytes, start, level);
        }
    }
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(instrumented: &str) -> &str {
        instrumented
            .strip_prefix("local __check_interrupt = __check_interrupt; ")
            .unwrap()
    }

    #[test]
    fn injects_after_block_openers() {
        let out = instrument("function run() while true do if x then y() else z() end end end");
        assert_eq!(
            body(&out),
            "function run() __check_interrupt(); while true do __check_interrupt(); if x then __check_interrupt(); y() else __check_interrupt(); z() end end end"
        );
    }

    #[test]
    fn repeat_and_anonymous_functions() {
        let out = instrument("local f = function(a, b) repeat a = a + 1 until a > b end");
        assert_eq!(
            body(&out),
            "local f = function(a, b) __check_interrupt(); repeat __check_interrupt(); a = a + 1 until a > b end"
        );
    }

    #[test]
    fn skips_strings_and_comments() {
        let source = "-- do then\nlocal s = 'do' .. \"then\\\" else\" .. [[repeat]] --[==[ do ]==]\nlocal t = [=[ ]] do ]=]";
        assert_eq!(body(&instrument(source)), source);
    }

    #[test]
    fn ignores_keyword_lookalikes() {
        let source = "local done, elsewhere, dot = 1, 2, 3 local x = 0x1do2";
        assert_eq!(body(&instrument(source)), source);
    }

    #[test]
    fn elseif_is_covered_by_its_then() {
        let out = instrument("if a then b() elseif c then d() end");
        assert_eq!(
            body(&out),
            "if a then __check_interrupt(); b() elseif c then __check_interrupt(); d() end"
        );
    }

    #[test]
    fn checks_before_every_goto() {
        let out = instrument("function run() ::top:: goto top end");
        assert_eq!(
            body(&out),
            "function run() __check_interrupt(); ::top:: __check_interrupt();goto top end"
        );

        let out = instrument("for i = 1, 3 do if i == 2 then goto continue end ::continue:: end");
        assert_eq!(
            body(&out),
            "for i = 1, 3 do __check_interrupt(); if i == 2 then __check_interrupt();  __check_interrupt();goto continue end ::continue:: end"
        );
    }

    #[test]
    fn preserves_line_count() {
        let source = "function run()\n  for i = 1, 3 do\n    print(i)\n  end\nend\n";
        assert_eq!(instrument(source).lines().count(), source.lines().count());
    }
}
