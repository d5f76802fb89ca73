//! Source transforms applied before bundling.
//!
//! Three passes: a syntax sanity check (unbalanced delimiters and
//! unterminated literals become [`SandboxError::Transpile`]), TypeScript
//! type-stripping at declaration level (`import type` / `export type`
//! lines, `interface` and `type` alias blocks), and JSX lowering to
//! `h(tag, props, ...children)` calls. Expression-level type annotations
//! are left to the generation guidelines; this is a bundler pass, not a
//! full compiler front-end.

use crate::error::{Result, SandboxError};

/// Run the transform pipeline appropriate for the file's extension.
pub fn transpile_file(file: &str, source: &str) -> Result<String> {
    check_syntax(file, source)?;

    let mut out = source.to_string();
    if matches!(extension(file), "ts" | "tsx") {
        out = strip_types(&out);
    }
    if matches!(extension(file), "jsx" | "tsx") {
        out = lower_jsx(file, &out)?;
    }
    Ok(out)
}

fn extension(file: &str) -> &str {
    file.rsplit('.').next().unwrap_or("")
}

fn transpile_err(file: &str, line: usize, message: impl Into<String>) -> SandboxError {
    SandboxError::Transpile {
        file: file.to_string(),
        message: format!("line {}: {}", line, message.into()),
    }
}

/// Words after which a `/` starts a regex literal rather than division.
const REGEX_PREFIX_WORDS: &[&str] = &[
    "return", "typeof", "case", "in", "of", "new", "delete", "void", "do", "else",
];

fn regex_can_start(prev: Option<char>, last_word: &str) -> bool {
    if REGEX_PREFIX_WORDS.contains(&last_word) {
        return true;
    }
    match prev {
        None => true,
        Some(c) => "=(,:[!&|?{};<>+-*%~^".contains(c),
    }
}

/// Delimiter-balance and literal-termination check.
///
/// Understands line/block comments, string and template literals (with
/// `${}` interpolation), and regex literals, so quotes inside those do not
/// confuse the count.
pub fn check_syntax(file: &str, source: &str) -> Result<()> {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;
    let mut prev: Option<char> = None;
    let mut word = String::new();
    let mut last_word = String::new();

    while i < len {
        let c = chars[i];

        if c.is_alphanumeric() || c == '_' || c == '$' {
            word.push(c);
        } else if !word.is_empty() {
            last_word = std::mem::take(&mut word);
        }

        match c {
            '\n' => {
                line += 1;
            }
            '/' if i + 1 < len && chars[i + 1] == '/' => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if i + 1 < len && chars[i + 1] == '*' => {
                let start_line = line;
                i += 2;
                loop {
                    if i + 1 >= len {
                        return Err(transpile_err(file, start_line, "unterminated block comment"));
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            '/' if regex_can_start(prev, &last_word) => {
                i += 1;
                let mut in_class = false;
                loop {
                    if i >= len || chars[i] == '\n' {
                        return Err(transpile_err(file, line, "unterminated regular expression"));
                    }
                    match chars[i] {
                        '\\' => i += 1,
                        '[' => in_class = true,
                        ']' => in_class = false,
                        '/' if !in_class => break,
                        _ => {}
                    }
                    i += 1;
                }
                prev = Some('/');
                i += 1;
                continue;
            }
            '\'' | '"' => {
                let quote = c;
                let start_line = line;
                i += 1;
                loop {
                    if i >= len || chars[i] == '\n' {
                        return Err(transpile_err(file, start_line, "unterminated string literal"));
                    }
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        break;
                    }
                    i += 1;
                }
                prev = Some(quote);
                i += 1;
                continue;
            }
            '`' => {
                let start_line = line;
                i += 1;
                loop {
                    if i >= len {
                        return Err(transpile_err(
                            file,
                            start_line,
                            "unterminated template literal",
                        ));
                    }
                    match chars[i] {
                        '\\' => i += 1,
                        '\n' => line += 1,
                        '`' => break,
                        '$' if i + 1 < len && chars[i + 1] == '{' => {
                            // Interpolation: balanced braces, strings skipped.
                            i += 2;
                            let mut depth = 1usize;
                            while i < len && depth > 0 {
                                match chars[i] {
                                    '\n' => line += 1,
                                    '{' => depth += 1,
                                    '}' => depth -= 1,
                                    '\'' | '"' => {
                                        let q = chars[i];
                                        i += 1;
                                        while i < len && chars[i] != q {
                                            if chars[i] == '\\' {
                                                i += 1;
                                            }
                                            i += 1;
                                        }
                                    }
                                    _ => {}
                                }
                                i += 1;
                            }
                            if depth > 0 {
                                return Err(transpile_err(
                                    file,
                                    start_line,
                                    "unterminated template interpolation",
                                ));
                            }
                            continue;
                        }
                        _ => {}
                    }
                    i += 1;
                }
                prev = Some('`');
                i += 1;
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(transpile_err(
                            file,
                            line,
                            format!("'{}' closes '{}' opened on line {}", c, open, open_line),
                        ));
                    }
                    None => {
                        return Err(transpile_err(file, line, format!("unmatched '{}'", c)));
                    }
                }
            }
            _ => {}
        }

        if !c.is_whitespace() {
            prev = Some(c);
        }
        i += 1;
    }

    if let Some((open, open_line)) = stack.pop() {
        return Err(transpile_err(
            file,
            open_line,
            format!("unclosed '{}'", open),
        ));
    }
    Ok(())
}

/// Remove declaration-level TypeScript syntax.
pub fn strip_types(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let lines: Vec<&str> = source.lines().collect();
    let mut i = 0usize;

    while i < lines.len() {
        let trimmed = lines[i].trim_start();

        if trimmed.starts_with("import type ") {
            i += 1;
            continue;
        }

        if trimmed.starts_with("interface ") || trimmed.starts_with("export interface ") {
            i = skip_braced_block(&lines, i);
            continue;
        }

        if trimmed.starts_with("type ") || trimmed.starts_with("export type ") {
            i = skip_type_alias(&lines, i);
            continue;
        }

        out.push_str(lines[i]);
        out.push('\n');
        i += 1;
    }
    out
}

/// Advance past a block that ends when its braces balance out.
fn skip_braced_block(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i32;
    let mut seen_open = false;
    for (offset, line) in lines[start..].iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    seen_open = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if seen_open && depth <= 0 {
            return start + offset + 1;
        }
    }
    lines.len()
}

/// Advance past a `type X = ...;` alias, which may span lines.
fn skip_type_alias(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i32;
    for (offset, line) in lines[start..].iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' | '(' | '[' | '<' => depth += 1,
                '}' | ')' | ']' | '>' => depth -= 1,
                _ => {}
            }
        }
        if depth <= 0 && line.trim_end().ends_with(';') {
            return start + offset + 1;
        }
    }
    lines.len()
}

/// Lower JSX elements to `h(tag, props, ...children)` calls.
///
/// Lowercase tags become string arguments, capitalized tags stay bare
/// component references. `{expr}` attribute values and children are copied
/// through (recursively lowered, so nested JSX inside expressions works).
pub fn lower_jsx(file: &str, source: &str) -> Result<String> {
    let mut rewriter = JsxRewriter {
        file,
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
    };
    rewriter.rewrite_all()
}

struct JsxRewriter<'a> {
    file: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl<'a> JsxRewriter<'a> {
    fn err(&self, message: impl Into<String>) -> SandboxError {
        transpile_err(self.file, self.line, message)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c == Some('\n') {
            self.line += 1;
        }
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn rewrite_all(&mut self) -> Result<String> {
        let mut out = String::with_capacity(self.chars.len());
        let mut prev: Option<char> = None;
        let mut word = String::new();
        let mut last_word = String::new();

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                word.push(c);
            } else if !word.is_empty() {
                last_word = std::mem::take(&mut word);
            }

            match c {
                // Literals and comments are copied verbatim.
                '\'' | '"' => {
                    self.copy_string(&mut out)?;
                    prev = Some(c);
                    continue;
                }
                '`' => {
                    self.copy_template(&mut out)?;
                    prev = Some(c);
                    continue;
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        out.push(self.bump().unwrap());
                    }
                    continue;
                }
                '/' if self.peek_at(1) == Some('*') => {
                    out.push(self.bump().unwrap());
                    out.push(self.bump().unwrap());
                    while let Some(c) = self.bump() {
                        out.push(c);
                        if c == '/' && out.ends_with("*/") {
                            break;
                        }
                    }
                    continue;
                }
                '/' if regex_can_start(prev, &last_word) => {
                    out.push(self.bump().unwrap());
                    let mut in_class = false;
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        out.push(self.bump().unwrap());
                        match c {
                            '\\' => {
                                if let Some(escaped) = self.bump() {
                                    out.push(escaped);
                                }
                            }
                            '[' => in_class = true,
                            ']' => in_class = false,
                            '/' if !in_class => break,
                            _ => {}
                        }
                    }
                    prev = Some('/');
                    continue;
                }
                '<' if self.jsx_starts_here(prev, &last_word) => {
                    let lowered = self.parse_element()?;
                    out.push_str(&lowered);
                    prev = Some(')');
                    continue;
                }
                _ => {}
            }

            if !c.is_whitespace() {
                prev = Some(c);
            }
            out.push(self.bump().unwrap());
        }
        Ok(out)
    }

    /// A `<` begins JSX when it sits in expression position and is followed
    /// by a tag name.
    fn jsx_starts_here(&self, prev: Option<char>, last_word: &str) -> bool {
        let next_is_tag = matches!(self.peek_at(1), Some(c) if c.is_ascii_alphabetic());
        if !next_is_tag {
            return false;
        }
        if last_word == "return" {
            return true;
        }
        match prev {
            None => true,
            Some(c) => "(,=?:[{;&|>".contains(c),
        }
    }

    fn copy_string(&mut self, out: &mut String) -> Result<()> {
        let quote = self.bump().unwrap();
        out.push(quote);
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string literal")),
                Some('\\') => {
                    out.push('\\');
                    if let Some(escaped) = self.bump() {
                        out.push(escaped);
                    }
                }
                Some(c) => {
                    out.push(c);
                    if c == quote {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn copy_template(&mut self, out: &mut String) -> Result<()> {
        out.push(self.bump().unwrap());
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated template literal")),
                Some('\\') => {
                    out.push('\\');
                    if let Some(escaped) = self.bump() {
                        out.push(escaped);
                    }
                }
                Some('`') => {
                    out.push('`');
                    return Ok(());
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_element(&mut self) -> Result<String> {
        self.bump(); // consume '<'
        let tag = self.read_tag_name()?;
        let tag_arg = if tag.chars().next().is_some_and(|c| c.is_uppercase()) {
            tag.clone()
        } else {
            format!("\"{}\"", tag)
        };

        let (props, self_closing) = self.parse_attributes()?;
        let mut call = format!("h({}, {}", tag_arg, props);

        if !self_closing {
            let children = self.parse_children(&tag)?;
            for child in children {
                call.push_str(", ");
                call.push_str(&child);
            }
        }
        call.push(')');
        Ok(call)
    }

    fn read_tag_name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.err("expected JSX tag name"));
        }
        Ok(name)
    }

    /// Returns the props object literal (or `null`) and whether the element
    /// was self-closing.
    fn parse_attributes(&mut self) -> Result<(String, bool)> {
        let mut props: Vec<(String, String)> = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.err("unterminated JSX element")),
                Some('>') => {
                    self.bump();
                    break;
                }
                Some('/') => {
                    self.bump();
                    self.skip_whitespace();
                    if self.bump() != Some('>') {
                        return Err(self.err("expected '>' after '/' in JSX element"));
                    }
                    let rendered = render_props(&props);
                    return Ok((rendered, true));
                }
                Some(_) => {
                    let name = self.read_attr_name()?;
                    self.skip_whitespace();
                    let value = if self.peek() == Some('=') {
                        self.bump();
                        self.skip_whitespace();
                        self.read_attr_value()?
                    } else {
                        "true".to_string()
                    };
                    props.push((name, value));
                }
            }
        }
        Ok((render_props(&props), false))
    }

    fn read_attr_name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.err("expected JSX attribute name"));
        }
        Ok(name)
    }

    fn read_attr_value(&mut self) -> Result<String> {
        match self.peek() {
            Some('"') | Some('\'') => {
                let mut value = String::new();
                self.copy_string(&mut value)?;
                // Normalize single-quoted attributes to double quotes.
                if value.starts_with('\'') {
                    let inner = &value[1..value.len() - 1];
                    Ok(format!("\"{}\"", inner.replace('"', "\\\"")))
                } else {
                    Ok(value)
                }
            }
            Some('{') => {
                let expr = self.read_braced_expression()?;
                // Expressions may themselves contain JSX.
                lower_jsx(self.file, &expr)
            }
            _ => Err(self.err("expected JSX attribute value")),
        }
    }

    /// Read a `{ ... }` expression, returning the inner text.
    fn read_braced_expression(&mut self) -> Result<String> {
        self.bump(); // consume '{'
        let mut expr = String::new();
        let mut depth = 1usize;
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated JSX expression")),
                Some('\'') | Some('"') => self.copy_string(&mut expr)?,
                Some('`') => self.copy_template(&mut expr)?,
                Some('{') => {
                    depth += 1;
                    expr.push(self.bump().unwrap());
                }
                Some('}') => {
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        return Ok(expr);
                    }
                    expr.push('}');
                }
                Some(_) => expr.push(self.bump().unwrap()),
            }
        }
    }

    fn parse_children(&mut self, tag: &str) -> Result<Vec<String>> {
        let mut children = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err(format!("missing closing tag for <{}>", tag))),
                Some('<') if self.peek_at(1) == Some('/') => {
                    flush_text(&mut text, &mut children);
                    self.bump();
                    self.bump();
                    let closing = self.read_tag_name()?;
                    if closing != tag {
                        return Err(self.err(format!(
                            "mismatched closing tag: expected </{}>, found </{}>",
                            tag, closing
                        )));
                    }
                    self.skip_whitespace();
                    if self.bump() != Some('>') {
                        return Err(self.err("expected '>' in closing tag"));
                    }
                    return Ok(children);
                }
                Some('<') => {
                    flush_text(&mut text, &mut children);
                    children.push(self.parse_element()?);
                }
                Some('{') => {
                    flush_text(&mut text, &mut children);
                    let expr = self.read_braced_expression()?;
                    let trimmed = expr.trim();
                    // `{/* comment */}` children vanish.
                    if !(trimmed.starts_with("/*") && trimmed.ends_with("*/")) && !trimmed.is_empty()
                    {
                        children.push(lower_jsx(self.file, &expr)?);
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }
}

fn render_props(props: &[(String, String)]) -> String {
    if props.is_empty() {
        return "null".to_string();
    }
    let rendered: Vec<String> = props
        .iter()
        .map(|(name, value)| format!("\"{}\": {}", name, value))
        .collect();
    format!("{{ {} }}", rendered.join(", "))
}

fn flush_text(text: &mut String, children: &mut Vec<String>) {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    text.clear();
    if !collapsed.is_empty() {
        children.push(format!(
            "\"{}\"",
            collapsed.replace('\\', "\\\\").replace('"', "\\\"")
        ));
    }
}
