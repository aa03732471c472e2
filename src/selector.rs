//! Minimal CSS selector matching over element descriptors.
//!
//! Supported: type (`button`, `*`), `#id`, `.class`, `[attr]`, `[attr=value]`,
//! descendant (` `) and child (`>`) combinators, and `,` lists. Enough for the
//! selectors funnel steps are written with; pseudo-classes are rejected.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementNode {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ElementNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), ..Default::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// An element plus its ancestors, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub target: ElementNode,
    #[serde(default)]
    pub ancestors: Vec<ElementNode>,
}

impl ElementDescriptor {
    pub fn new(target: ElementNode) -> Self {
        Self { target, ancestors: Vec::new() }
    }

    pub fn inside(mut self, parent: ElementNode) -> Self {
        self.ancestors.push(parent);
        self
    }

    fn chain(&self) -> Vec<&ElementNode> {
        std::iter::once(&self.target).chain(self.ancestors.iter()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrTest {
    Present(String),
    Equals(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrTest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    compounds: Vec<Compound>,
    // combinators[i] sits between compounds[i] and compounds[i + 1]
    combinators: Vec<Combinator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Complex>,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String> {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if !is_ident_char(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    if out.is_empty() {
        bail!("expected identifier");
    }
    Ok(out)
}

impl Compound {
    fn parse(src: &str) -> Result<Self> {
        let mut out = Compound::default();
        let mut chars = src.chars().peekable();
        match chars.peek() {
            Some('*') => {
                chars.next();
            }
            Some(&c) if is_ident_char(c) => out.tag = Some(take_ident(&mut chars)?),
            _ => {}
        }
        while let Some(c) = chars.next() {
            match c {
                '#' => out.id = Some(take_ident(&mut chars)?),
                '.' => out.classes.push(take_ident(&mut chars)?),
                '[' => {
                    let body: String = chars.by_ref().take_while(|&c| c != ']').collect();
                    out.attrs.push(parse_attr(&body)?);
                }
                other => bail!("unsupported selector character {:?} in {:?}", other, src),
            }
        }
        Ok(out)
    }

    fn matches(&self, node: &ElementNode) -> bool {
        if let Some(tag) = &self.tag {
            if !tag.eq_ignore_ascii_case(&node.tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| node.classes.iter().any(|nc| nc == c)) {
            return false;
        }
        self.attrs.iter().all(|t| match t {
            AttrTest::Present(name) => node.attributes.contains_key(name),
            AttrTest::Equals(name, value) => node.attributes.get(name) == Some(value),
        })
    }
}

fn parse_attr(body: &str) -> Result<AttrTest> {
    let body = body.trim();
    match body.split_once('=') {
        None => {
            if body.is_empty() || !body.chars().all(is_ident_char) {
                bail!("bad attribute selector [{}]", body);
            }
            Ok(AttrTest::Present(body.to_string()))
        }
        Some((name, value)) => {
            let name = name.trim();
            if name.is_empty() || !name.chars().all(is_ident_char) {
                bail!("bad attribute selector [{}]", body);
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Ok(AttrTest::Equals(name.to_string(), value.to_string()))
        }
    }
}

/// Splits on `sep` outside brackets and quotes.
fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') if depth > 0 => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

impl Complex {
    fn parse(src: &str) -> Result<Self> {
        let src = src.trim();
        if src.is_empty() {
            bail!("empty selector");
        }
        let mut compounds = Vec::new();
        let mut combinators = Vec::new();
        let mut pending: Option<Combinator> = None;
        let mut buf = String::new();
        let mut depth = 0usize;

        let flush = |buf: &mut String, compounds: &mut Vec<Compound>| -> Result<()> {
            if !buf.is_empty() {
                compounds.push(Compound::parse(buf)?);
                buf.clear();
            }
            Ok(())
        };

        for c in src.chars() {
            if depth > 0 {
                buf.push(c);
                if c == ']' {
                    depth -= 1;
                }
                continue;
            }
            match c {
                '>' => {
                    flush(&mut buf, &mut compounds)?;
                    if compounds.is_empty() || pending == Some(Combinator::Child) {
                        bail!("dangling '>' in {:?}", src);
                    }
                    pending = Some(Combinator::Child);
                }
                c if c.is_whitespace() => {
                    flush(&mut buf, &mut compounds)?;
                    if pending.is_none() {
                        pending = Some(Combinator::Descendant);
                    }
                }
                c => {
                    if buf.is_empty() && !compounds.is_empty() {
                        let comb = pending.take().ok_or_else(|| anyhow!("missing combinator in {:?}", src))?;
                        combinators.push(comb);
                    }
                    if c == '[' {
                        depth += 1;
                    }
                    buf.push(c);
                }
            }
        }
        flush(&mut buf, &mut compounds)?;
        if depth > 0 {
            bail!("unclosed attribute selector in {:?}", src);
        }
        if pending == Some(Combinator::Child) && combinators.len() + 1 == compounds.len() {
            bail!("trailing '>' in {:?}", src);
        }
        Ok(Self { compounds, combinators })
    }

    fn matches_at(&self, chain: &[&ElementNode], k: usize, pos: usize) -> bool {
        if !self.compounds[k].matches(chain[pos]) {
            return false;
        }
        if k == 0 {
            return true;
        }
        match self.combinators[k - 1] {
            Combinator::Child => pos + 1 < chain.len() && self.matches_at(chain, k - 1, pos + 1),
            Combinator::Descendant => (pos + 1..chain.len()).any(|p| self.matches_at(chain, k - 1, p)),
        }
    }

    fn matches_chain(&self, chain: &[&ElementNode]) -> bool {
        !chain.is_empty() && self.matches_at(chain, self.compounds.len() - 1, 0)
    }
}

impl Selector {
    pub fn parse(src: &str) -> Result<Self> {
        let alternatives = split_top_level(src, ',')
            .into_iter()
            .map(Complex::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { alternatives })
    }

    /// Matches the target element itself.
    pub fn matches(&self, el: &ElementDescriptor) -> bool {
        let chain = el.chain();
        self.alternatives.iter().any(|c| c.matches_chain(&chain))
    }

    /// Matches the target or any ancestor, like `Element.closest`.
    pub fn matches_closest(&self, el: &ElementDescriptor) -> bool {
        let chain = el.chain();
        (0..chain.len()).any(|i| self.alternatives.iter().any(|c| c.matches_chain(&chain[i..])))
    }
}
