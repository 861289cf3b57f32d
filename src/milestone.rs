use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// CSS class of the inline span that carries a credited-time value.
pub const MILESTONE_CLASS: &str = "tps_jalon";

/// Finds the first `<span class="tps_jalon">` in an activity description and
/// returns its body coerced to whole minutes.
///
/// Descriptions are rich-text HTML, so the reader runs with end-name checks
/// off: unclosed `<br>` or `<p>` elements and entities like `&nbsp;` do not
/// stop the scan. Markup the reader cannot get past before the marker yields
/// `None`, never an error.
pub fn extract_milestone(text: &str) -> Option<i64> {
    let mut reader = Reader::from_str(text);
    reader.check_end_names(false);
    reader.trim_text(false);

    // depth > 0 while inside the marker span (nested spans increase it)
    let mut depth: usize = 0;
    let mut body = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth > 0 {
                    if is_span(&e) {
                        depth += 1;
                    }
                } else if is_span(&e) && has_milestone_class(&e) {
                    depth = 1;
                }
            }
            Ok(Event::End(e)) => {
                if depth > 0 && e.name().as_ref().eq_ignore_ascii_case(b"span") {
                    depth -= 1;
                    if depth == 0 {
                        return if body.is_empty() {
                            None
                        } else {
                            Some(coerce_int(&body))
                        };
                    }
                }
            }
            Ok(Event::Text(t)) if depth > 0 => {
                body.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::CData(t)) if depth > 0 => {
                body.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn is_span(e: &BytesStart<'_>) -> bool {
    e.name().as_ref().eq_ignore_ascii_case(b"span")
}

fn has_milestone_class(e: &BytesStart<'_>) -> bool {
    e.html_attributes().flatten().any(|a| {
        if !a.key.as_ref().eq_ignore_ascii_case(b"class") {
            return false;
        }
        String::from_utf8_lossy(&a.value)
            .trim()
            .eq_ignore_ascii_case(MILESTONE_CLASS)
    })
}

/// C-style integer cast: skips leading whitespace, reads an optional sign and
/// the leading digit run, ignores the rest. No digits gives 0.
pub fn coerce_int(raw: &str) -> i64 {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(|b| b.is_ascii_digit()) {
        let d = i64::from(b - b'0');
        value = value.saturating_mul(10).saturating_add(d);
    }
    if negative {
        -value
    } else {
        value
    }
}
