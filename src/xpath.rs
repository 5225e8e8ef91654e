//! The path-expression subset understood by the in-memory document.
//!
//! Supported: `/` and `//` separators, leading `/`, `//` or `.`, `.` and `..` steps,
//! `*` or a tag name, and the predicates `[n]`, `[last()]`, `[@attr]`, `[@attr='value']`.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid path expression {expr:?}: {message}")]
pub struct XPathError {
    pub expr: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Starts above the root element (`/root`, `//tag`).
    Document,
    /// Starts at the root element (`.`, `./tag`, `tag`).
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    /// `//`: any descendant-or-self of the context, then its children.
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    SelfNode,
    Parent,
    Any,
    Tag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// 1-based position among the step's matches for one context node.
    Position(usize),
    Last,
    HasAttribute(String),
    AttributeEquals(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    pub anchor: Anchor,
    pub steps: Vec<Step>,
}

impl PathExpr {
    pub fn parse(expr: &str) -> Result<Self, XPathError> {
        let fail = |message: &str| XPathError {
            expr: expr.to_string(),
            message: message.to_string(),
        };

        let text = expr.trim();
        if text.is_empty() {
            return Err(fail("empty expression"));
        }

        let (anchor, rest, mut axis) = if let Some(rest) = text.strip_prefix("//") {
            (Anchor::Document, rest, Axis::Descendant)
        } else if let Some(rest) = text.strip_prefix('/') {
            (Anchor::Document, rest, Axis::Child)
        } else {
            (Anchor::Context, text, Axis::Child)
        };

        let mut steps = Vec::new();
        for segment in split_top_level(rest).map_err(|m| fail(m))? {
            if segment.is_empty() {
                if axis == Axis::Descendant {
                    return Err(fail("empty step"));
                }
                axis = Axis::Descendant;
                continue;
            }
            steps.push(parse_step(segment, axis).map_err(|m| fail(&m))?);
            axis = Axis::Child;
        }

        if axis == Axis::Descendant {
            return Err(fail("expression ends with a separator"));
        }
        if steps.is_empty() && anchor == Anchor::Document {
            return Err(fail("no steps"));
        }

        Ok(Self { anchor, steps })
    }
}

/// Split on `/` outside of predicates and quoted strings.
fn split_top_level(text: &str) -> Result<Vec<&str>, &'static str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, ch) in text.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.checked_sub(1).ok_or("unbalanced ']'")?,
            (None, '/') if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if quote.is_some() {
        return Err("unterminated string");
    }
    if depth != 0 {
        return Err("unbalanced '['");
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn parse_step(segment: &str, axis: Axis) -> Result<Step, String> {
    let (name, mut rest) = match segment.find('[') {
        Some(i) => (&segment[..i], &segment[i..]),
        None => (segment, ""),
    };

    let test = match name.trim() {
        "." => NodeTest::SelfNode,
        ".." => NodeTest::Parent,
        "*" => NodeTest::Any,
        "" => return Err("missing node test".to_string()),
        tag if tag.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | ':')) => {
            NodeTest::Tag(tag.to_string())
        }
        tag => return Err(format!("unsupported node test {tag:?}")),
    };

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let Some(body) = rest.strip_prefix('[') else {
            return Err(format!("unexpected text {rest:?}"));
        };
        let close = find_close(body).ok_or("unbalanced '['")?;
        predicates.push(parse_predicate(body[..close].trim())?);
        rest = &body[close + 1..];
    }

    if !predicates.is_empty() && matches!(test, NodeTest::SelfNode | NodeTest::Parent) {
        return Err("predicates are not supported on '.' or '..'".to_string());
    }

    Ok(Step {
        axis,
        test,
        predicates,
    })
}

fn find_close(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in body.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_predicate(body: &str) -> Result<Predicate, String> {
    if body == "last()" {
        return Ok(Predicate::Last);
    }
    if let Ok(position) = body.parse::<usize>() {
        if position == 0 {
            return Err("positions are 1-based".to_string());
        }
        return Ok(Predicate::Position(position));
    }

    let Some(attr) = body.strip_prefix('@') else {
        return Err(format!("unsupported predicate {body:?}"));
    };
    let Some((name, value)) = attr.split_once('=') else {
        return Ok(Predicate::HasAttribute(attr.trim().to_string()));
    };

    let value = value.trim();
    let unquoted = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .ok_or_else(|| format!("attribute value must be quoted: {value}"))?;

    Ok(Predicate::AttributeEquals(
        name.trim().to_string(),
        unquoted.to_string(),
    ))
}
