//! Permissive RSS/Atom extraction.
//!
//! Feeds in the wild are frequently not well-formed XML (unescaped ampersands,
//! mismatched tags), so entries are located by tag patterns
//! rather than by building a document tree. A broken entry costs only itself.

const ITEM_TAGS: [&str; 2] = ["item", "entry"];
const DATE_TAGS: [&str; 4] = ["pubDate", "dc:date", "published", "updated"];
const SUMMARY_TAGS: [&str; 4] = ["description", "summary", "content:encoded", "content"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
    Unknown,
}

/// One entry as found in the document, before any normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub published_raw: Option<String>,
    pub summary_raw: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    /// Channel or feed level `<title>`
    pub title: Option<String>,
    pub entries: Vec<RawEntry>,
    /// Entries dropped for lacking both a title and a link
    pub skipped: usize,
}

struct OpenTag<'a> {
    start: usize,
    end: usize,
    attrs: &'a str,
    self_closing: bool,
}

/// Extracts up to `max_items` entries from raw feed text.
///
/// `<item>` blocks are tried first; a document without any falls back to
/// Atom `<entry>` blocks. Freshest entries are assumed to come first.
pub fn parse_feed(text: &str, max_items: usize) -> ParsedFeed {
    let mut format = FeedFormat::Unknown;
    let mut preamble_end = text.len();
    let mut blocks = None;

    for (tag, candidate) in ITEM_TAGS.iter().zip([FeedFormat::Rss, FeedFormat::Atom]) {
        let mut found = element_blocks(text, *tag).peekable();
        if let Some(&(first_start, _)) = found.peek() {
            format = candidate;
            preamble_end = first_start;
            blocks = Some(found);
            break;
        }
    }

    let title = element_text(&text[..preamble_end], "title");

    let mut entries = Vec::new();
    let mut skipped = 0;
    for (_, block) in blocks.into_iter().flatten() {
        if entries.len() >= max_items {
            break;
        }
        let entry = parse_entry(block);
        if entry.title.is_none() && entry.link.is_none() {
            skipped += 1;
            continue;
        }
        entries.push(entry);
    }

    ParsedFeed {
        format,
        title,
        entries,
        skipped,
    }
}

fn parse_entry(block: &str) -> RawEntry {
    let link = element_text(block, "link").or_else(|| link_href(block));
    RawEntry {
        title: element_text(block, "title"),
        link,
        published_raw: DATE_TAGS.iter().find_map(|tag| element_text(block, tag)),
        summary_raw: SUMMARY_TAGS.iter().find_map(|tag| element_text(block, tag)),
    }
}

/// Yields `(start, body)` for every `<name ...>body</name>` in `xml`, lazily.
///
/// A block whose closing tag is missing ends where the next block of the same
/// name starts, or at the end of the document. The closing tag is only searched
/// for up to that point, so the document is scanned in linear time.
fn element_blocks<'a>(xml: &'a str, name: &'a str) -> impl Iterator<Item = (usize, &'a str)> + 'a {
    let mut next_open = find_open_tag(xml, name, 0);

    std::iter::from_fn(move || loop {
        let open = next_open.take()?;
        let following = find_open_tag(xml, name, open.end);
        let bound = following.as_ref().map_or(xml.len(), |t| t.start);
        next_open = following;

        if open.self_closing {
            continue;
        }
        let body_end = find_close_tag(&xml[..bound], name, open.end)
            .map_or(bound, |(close_start, _)| close_start);
        return Some((open.start, &xml[open.end..body_end]));
    })
}

/// Text content of the first non-empty `<name>` element, with CDATA unwrapped
/// and entities decoded.
pub fn element_text(xml: &str, name: &str) -> Option<String> {
    let mut pos = 0;
    while let Some(open) = find_open_tag(xml, name, pos) {
        pos = open.end;
        if open.self_closing {
            continue;
        }
        let Some((close_start, _)) = find_close_tag(xml, name, open.end) else {
            return None;
        };
        let text = decode_entities(&unwrap_cdata(&xml[open.end..close_start]));
        let text = text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    None
}

/// Atom style `<link href="..."/>`, preferring the alternate (or unlabelled) link.
fn link_href(block: &str) -> Option<String> {
    let mut fallback = None;
    let mut pos = 0;

    while let Some(open) = find_open_tag(block, "link", pos) {
        pos = open.end;
        let Some(href) = attr_value(open.attrs, "href") else {
            continue;
        };
        let href = decode_entities(href.trim());
        if href.is_empty() {
            continue;
        }
        match attr_value(open.attrs, "rel") {
            None | Some("alternate") => return Some(href),
            Some(_) => {
                fallback.get_or_insert(href);
            }
        }
    }

    fallback
}

fn find_open_tag<'a>(xml: &'a str, name: &str, from: usize) -> Option<OpenTag<'a>> {
    let pattern = format!("<{}", name);
    let mut pos = from;

    while let Some(offset) = xml.get(pos..)?.find(&pattern) {
        let start = pos + offset;
        let after_name = start + pattern.len();
        match xml[after_name..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_whitespace() => {
                let gt = after_name + xml[after_name..].find('>')?;
                let attrs = &xml[after_name..gt];
                return Some(OpenTag {
                    start,
                    end: gt + 1,
                    attrs,
                    self_closing: attrs.trim_end().ends_with('/'),
                });
            }
            _ => pos = after_name,
        }
    }

    None
}

fn find_close_tag(xml: &str, name: &str, from: usize) -> Option<(usize, usize)> {
    let pattern = format!("</{}", name);
    let mut pos = from;

    while let Some(offset) = xml.get(pos..)?.find(&pattern) {
        let start = pos + offset;
        let after_name = start + pattern.len();
        match xml[after_name..].chars().next() {
            Some(c) if c == '>' || c.is_whitespace() => {
                let gt = after_name + xml[after_name..].find('>')?;
                return Some((start, gt + 1));
            }
            _ => pos = after_name,
        }
    }

    None
}

fn attr_value<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut pos = 0;
    while let Some(offset) = attrs[pos..].find(name) {
        let start = pos + offset;
        pos = start + name.len();

        let boundary = attrs[..start]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        if !boundary {
            continue;
        }
        let rest = attrs[pos..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            continue;
        }
        let value = &rest[1..];
        let end = value.find(quote)?;
        return Some(&value[..end]);
    }
    None
}

/// Replaces every `<![CDATA[...]]>` section with its contents.
pub fn unwrap_cdata(s: &str) -> String {
    const OPEN: &str = "<![CDATA[";
    const CLOSE: &str = "]]>";

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let inner = &rest[start + OPEN.len()..];
        match inner.find(CLOSE) {
            Some(end) => {
                out.push_str(&inner[..end]);
                rest = &inner[end + CLOSE.len()..];
            }
            None => {
                out.push_str(inner);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decodes the predefined XML entities and numeric character references.
/// Anything else, including a bare `&`, is kept verbatim.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        match candidate.find(';').filter(|&semi| semi <= 10) {
            Some(semi) => match decode_entity(&candidate[1..semi]) {
                Some(c) => {
                    out.push(c);
                    rest = &candidate[semi + 1..];
                }
                None => {
                    out.push('&');
                    rest = &candidate[1..];
                }
            },
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse::<u32>().ok()?
            };
            char::from_u32(code)
        }
    }
}
