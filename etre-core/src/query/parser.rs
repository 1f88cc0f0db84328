//! Selector parser.
//!
//! Grammar: predicates separated by `,`; each predicate is a bare label
//! (existence), `!label` (non-existence), `label OP value`, or
//! `label in|notin (v1, v2, ...)`. Whitespace is insignificant around
//! tokens. Values parse as integers when possible, `true`/`false` as
//! booleans, anything else as a string.

use std::iter::Peekable;
use std::str::Chars;

use crate::query::ast::{Operator, Predicate, Query};
use crate::{Error, Result, Value};

/// Parse a selector string into a query.
pub fn parse(selector: &str) -> Result<Query> {
    Parser::new(selector).parse()
}

/// Characters that terminate a label or bare word.
fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '=' | '!' | '<' | '>' | '(' | ')')
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(selector: &'a str) -> Self {
        Self {
            chars: selector.chars().peekable(),
        }
    }

    fn parse(mut self) -> Result<Query> {
        let mut predicates = Vec::new();

        loop {
            self.skip_whitespace();
            if self.chars.peek().is_none() {
                if predicates.is_empty() {
                    return Err(Error::invalid_query("empty selector"));
                }
                return Err(Error::invalid_query("trailing comma in selector"));
            }

            predicates.push(self.parse_predicate()?);

            self.skip_whitespace();
            match self.chars.next() {
                None => break,
                Some(',') => continue,
                Some(c) => {
                    return Err(Error::invalid_query(format!(
                        "unexpected character '{}' after predicate",
                        c
                    )))
                }
            }
        }

        Ok(Query { predicates })
    }

    fn parse_predicate(&mut self) -> Result<Predicate> {
        if self.chars.peek() == Some(&'!') {
            self.chars.next();
            self.skip_whitespace();
            let label = self.scan_label()?;
            self.skip_whitespace();
            // A negated label takes no operator or value.
            match self.chars.peek() {
                None | Some(',') => return Ok(Predicate::new(label, Operator::NotExists, vec![])),
                Some(c) => {
                    return Err(Error::invalid_query(format!(
                        "unexpected character '{}' after !{}",
                        c, label
                    )))
                }
            }
        }

        let label = self.scan_label()?;
        self.skip_whitespace();

        match self.chars.peek() {
            None | Some(',') => Ok(Predicate::new(label, Operator::Exists, vec![])),
            Some('=') => {
                self.chars.next();
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                }
                let value = self.scan_value(&label)?;
                Ok(Predicate::new(label, Operator::Eq, vec![value]))
            }
            Some('!') => {
                self.chars.next();
                if self.chars.next() != Some('=') {
                    return Err(Error::invalid_query(format!(
                        "expected != after label {}",
                        label
                    )));
                }
                let value = self.scan_value(&label)?;
                Ok(Predicate::new(label, Operator::Ne, vec![value]))
            }
            Some('<') => {
                self.chars.next();
                if self.chars.peek() == Some(&'=') {
                    return Err(Error::invalid_query("operator <= is not supported"));
                }
                let value = self.scan_value(&label)?;
                Ok(Predicate::new(label, Operator::Lt, vec![value]))
            }
            Some('>') => {
                self.chars.next();
                if self.chars.peek() == Some(&'=') {
                    return Err(Error::invalid_query("operator >= is not supported"));
                }
                let value = self.scan_value(&label)?;
                Ok(Predicate::new(label, Operator::Gt, vec![value]))
            }
            _ => {
                let word = self.scan_word();
                let op = match word.as_str() {
                    "in" => Operator::In,
                    "notin" => Operator::NotIn,
                    _ => {
                        return Err(Error::invalid_query(format!(
                            "unknown operator '{}' for label {}",
                            word, label
                        )))
                    }
                };
                let values = self.scan_value_list(&label)?;
                Ok(Predicate::new(label, op, values))
            }
        }
    }

    fn scan_label(&mut self) -> Result<String> {
        let mut label = String::new();
        while let Some(&c) = self.chars.peek() {
            if is_delimiter(c) {
                break;
            }
            label.push(c);
            self.chars.next();
        }
        if label.is_empty() {
            return Err(Error::invalid_query("expected label"));
        }
        Ok(label)
    }

    fn scan_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if is_delimiter(c) {
                break;
            }
            word.push(c);
            self.chars.next();
        }
        word
    }

    /// Scan a scalar value: everything up to the next predicate separator.
    fn scan_value(&mut self, label: &str) -> Result<Value> {
        self.skip_whitespace();
        let mut raw = String::new();
        while let Some(&c) = self.chars.peek() {
            if c == ',' {
                break;
            }
            raw.push(c);
            self.chars.next();
        }
        let raw = raw.trim_end();
        if raw.is_empty() {
            return Err(Error::invalid_query(format!(
                "missing value for label {}",
                label
            )));
        }
        Ok(coerce(raw))
    }

    /// Scan a parenthesised, comma-separated value list.
    fn scan_value_list(&mut self, label: &str) -> Result<Vec<Value>> {
        self.skip_whitespace();
        if self.chars.next() != Some('(') {
            return Err(Error::invalid_query(format!(
                "expected ( after in/notin for label {}",
                label
            )));
        }

        let mut values = Vec::new();
        loop {
            self.skip_whitespace();
            let mut raw = String::new();
            loop {
                match self.chars.peek() {
                    None => {
                        return Err(Error::invalid_query(format!(
                            "unterminated value list for label {}",
                            label
                        )))
                    }
                    Some(&c) if c == ',' || c == ')' => break,
                    Some(&c) => {
                        raw.push(c);
                        self.chars.next();
                    }
                }
            }
            let raw = raw.trim_end();
            if raw.is_empty() {
                return Err(Error::invalid_query(format!(
                    "empty value in list for label {}",
                    label
                )));
            }
            values.push(coerce(raw));

            match self.chars.next() {
                Some(',') => continue,
                Some(')') => break,
                _ => unreachable!("value scan stops only at , or )"),
            }
        }

        Ok(values)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }
}

/// Integer if it parses as one, boolean for the literals, string otherwise.
fn coerce(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}
