//! Parser and evaluator for the expression language the mock store accepts.
//!
//! Covers the subset the mapper emits plus what callers commonly write by
//! hand: comparisons, `BETWEEN`, `IN`, `begins_with`, `contains`,
//! `attribute_exists`, `attribute_not_exists`, `size`, boolean `AND`/`OR`/`NOT`
//! and parentheses. Update expressions support `SET` (with `+`, `-`,
//! `list_append` and `if_not_exists`), `REMOVE`, `ADD` and `DELETE`.

use std::cmp::Ordering;

use tessera_types::{AttributeValue, ExpressionAttributes, Item, StoreError, StoreResult};

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::Validation { message: message.into() }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Name(String),
    Value(String),
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
}

fn tokenize(input: &str) -> StoreResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let word = |start: usize| {
        let mut end = start;
        while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '.') {
            end += 1;
        }
        (chars[start..end].iter().collect::<String>(), end)
    };
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            },
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            },
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            },
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            },
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            },
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            },
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Ne);
                    i += 2;
                },
                Some('=') => {
                    tokens.push(Token::Le);
                    i += 2;
                },
                _ => {
                    tokens.push(Token::Lt);
                    i += 1;
                },
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            },
            '#' | ':' => {
                let (text, end) = word(i + 1);
                if text.is_empty() {
                    return Err(invalid(format!("empty placeholder at offset {i}")));
                }
                tokens.push(if c == '#' { Token::Name(format!("#{text}")) } else { Token::Value(format!(":{text}")) });
                i = end;
            },
            c if c.is_alphabetic() || c == '_' => {
                let (text, end) = word(i);
                tokens.push(Token::Ident(text));
                i = end;
            },
            other => return Err(invalid(format!("unexpected character '{other}' at offset {i}"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Operand {
    Path(String),
    Value(AttributeValue),
    Size(String),
}

impl Operand {
    #[allow(clippy::cast_precision_loss)]
    fn resolve(&self, item: &Item) -> Option<AttributeValue> {
        match self {
            Self::Path(field) => item.get(field).cloned(),
            Self::Value(value) => Some(value.clone()),
            Self::Size(field) => {
                item.get(field).and_then(AttributeValue::size).map(|n| AttributeValue::Number(n as f64))
            },
        }
    }
}

/// A parsed condition, key condition, or filter expression.
#[derive(Debug, Clone)]
pub(crate) enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare(Operand, Comparator, Operand),
    Between(Operand, Operand, Operand),
    In(Operand, Vec<Operand>),
    Exists(String),
    NotExists(String),
    BeginsWith(Operand, Operand),
    Contains(Operand, Operand),
}

impl Condition {
    /// Evaluates the condition against an item. Missing attributes and type
    /// mismatches make comparisons false.
    pub(crate) fn evaluate(&self, item: &Item) -> bool {
        match self {
            Self::And(a, b) => a.evaluate(item) && b.evaluate(item),
            Self::Or(a, b) => a.evaluate(item) || b.evaluate(item),
            Self::Not(c) => !c.evaluate(item),
            Self::Compare(left, cmp, right) => match (left.resolve(item), right.resolve(item)) {
                (Some(l), Some(r)) => match cmp {
                    Comparator::Eq => l == r,
                    Comparator::Ne => l != r,
                    _ => l.compare(&r).is_some_and(|o| cmp.holds(o)),
                },
                (None, Some(_)) => matches!(cmp, Comparator::Ne),
                _ => false,
            },
            Self::Between(value, low, high) => {
                match (value.resolve(item), low.resolve(item), high.resolve(item)) {
                    (Some(v), Some(lo), Some(hi)) => {
                        v.compare(&lo).is_some_and(|o| o != Ordering::Less)
                            && v.compare(&hi).is_some_and(|o| o != Ordering::Greater)
                    },
                    _ => false,
                }
            },
            Self::In(value, candidates) => value
                .resolve(item)
                .is_some_and(|v| candidates.iter().filter_map(|c| c.resolve(item)).any(|c| c == v)),
            Self::Exists(field) => item.contains_key(field),
            Self::NotExists(field) => !item.contains_key(field),
            Self::BeginsWith(value, prefix) => match (value.resolve(item), prefix.resolve(item)) {
                (Some(AttributeValue::String(s)), Some(AttributeValue::String(p))) => s.starts_with(&p),
                (Some(AttributeValue::Binary(b)), Some(AttributeValue::Binary(p))) => b.starts_with(&p),
                _ => false,
            },
            Self::Contains(value, needle) => match (value.resolve(item), needle.resolve(item)) {
                (Some(AttributeValue::String(s)), Some(AttributeValue::String(n))) => s.contains(&n),
                (Some(AttributeValue::StringSet(set)), Some(AttributeValue::String(n))) => set.contains(&n),
                (Some(AttributeValue::NumberSet(set)), Some(AttributeValue::Number(n))) => set.contains(&n),
                (Some(AttributeValue::BinarySet(set)), Some(AttributeValue::Binary(n))) => set.contains(&n),
                (Some(AttributeValue::List(list)), Some(n)) => list.contains(&n),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ValueExpr {
    Operand(Operand),
    Plus(Box<ValueExpr>, Box<ValueExpr>),
    Minus(Box<ValueExpr>, Box<ValueExpr>),
    ListAppend(Box<ValueExpr>, Box<ValueExpr>),
    IfNotExists(String, Box<ValueExpr>),
}

impl ValueExpr {
    fn evaluate(&self, item: &Item) -> StoreResult<AttributeValue> {
        match self {
            Self::Operand(operand) => {
                operand.resolve(item).ok_or_else(|| invalid("operand refers to a missing attribute"))
            },
            Self::Plus(a, b) | Self::Minus(a, b) => {
                let (a, b) = (a.evaluate(item)?, b.evaluate(item)?);
                match (a.as_number(), b.as_number()) {
                    (Some(a), Some(b)) if matches!(self, Self::Plus(..)) => Ok(AttributeValue::Number(a + b)),
                    (Some(a), Some(b)) => Ok(AttributeValue::Number(a - b)),
                    _ => Err(invalid("arithmetic on a non-number")),
                }
            },
            Self::ListAppend(a, b) => match (a.evaluate(item)?, b.evaluate(item)?) {
                (AttributeValue::List(mut a), AttributeValue::List(b)) => {
                    a.extend(b);
                    Ok(AttributeValue::List(a))
                },
                _ => Err(invalid("list_append requires two lists")),
            },
            Self::IfNotExists(field, fallback) => match item.get(field) {
                Some(value) => Ok(value.clone()),
                None => fallback.evaluate(item),
            },
        }
    }
}

/// A parsed update expression.
#[derive(Debug, Clone, Default)]
pub(crate) struct UpdateExpression {
    set: Vec<(String, ValueExpr)>,
    remove: Vec<String>,
    add: Vec<(String, AttributeValue)>,
    delete: Vec<(String, AttributeValue)>,
}

impl UpdateExpression {
    /// Applies every action to `item`. Right-hand sides see the item as it
    /// was before the update.
    pub(crate) fn apply(&self, item: &mut Item) -> StoreResult<()> {
        let before = item.clone();
        for (field, value) in &self.set {
            item.insert(field.clone(), value.evaluate(&before)?);
        }
        for field in &self.remove {
            item.remove(field);
        }
        for (field, value) in &self.add {
            let merged = match (item.remove(field), value) {
                (None, value) => value.clone(),
                (Some(AttributeValue::Number(a)), AttributeValue::Number(b)) => AttributeValue::Number(a + b),
                (Some(AttributeValue::StringSet(mut a)), AttributeValue::StringSet(b)) => {
                    a.extend(b.iter().cloned());
                    AttributeValue::StringSet(a)
                },
                (Some(AttributeValue::NumberSet(a)), AttributeValue::NumberSet(b)) => {
                    AttributeValue::number_set(a.into_iter().chain(b.iter().copied()))
                },
                (Some(AttributeValue::BinarySet(mut a)), AttributeValue::BinarySet(b)) => {
                    a.extend(b.iter().cloned());
                    AttributeValue::BinarySet(a)
                },
                (Some(existing), value) => {
                    return Err(invalid(format!(
                        "ADD of {} to {} attribute '{field}'",
                        value.type_name(),
                        existing.type_name()
                    )));
                },
            };
            item.insert(field.clone(), merged);
        }
        for (field, value) in &self.delete {
            let Some(existing) = item.remove(field) else { continue };
            let remaining = match (existing, value) {
                (AttributeValue::StringSet(mut a), AttributeValue::StringSet(b)) => {
                    a.retain(|v| !b.contains(v));
                    (!a.is_empty()).then_some(AttributeValue::StringSet(a))
                },
                (AttributeValue::NumberSet(mut a), AttributeValue::NumberSet(b)) => {
                    a.retain(|v| !b.contains(v));
                    (!a.is_empty()).then_some(AttributeValue::NumberSet(a))
                },
                (AttributeValue::BinarySet(mut a), AttributeValue::BinarySet(b)) => {
                    a.retain(|v| !b.contains(v));
                    (!a.is_empty()).then_some(AttributeValue::BinarySet(a))
                },
                (existing, _) => {
                    return Err(invalid(format!("DELETE from {} attribute '{field}'", existing.type_name())));
                },
            };
            if let Some(remaining) = remaining {
                item.insert(field.clone(), remaining);
            }
        }
        Ok(())
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    attributes: &'a ExpressionAttributes,
}

impl<'a> Parser<'a> {
    fn new(input: &str, attributes: &'a ExpressionAttributes) -> StoreResult<Self> {
        Ok(Self { tokens: tokenize(input)?, pos: 0, attributes })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> StoreResult<Token> {
        let token = self.tokens.get(self.pos).cloned().ok_or_else(|| invalid("unexpected end of expression"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> StoreResult<()> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(invalid(format!("expected {expected:?}, found {token:?}")))
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn finish(&self) -> StoreResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(invalid(format!("unexpected trailing {token:?}"))),
        }
    }

    fn name(&self, placeholder: &str) -> StoreResult<String> {
        self.attributes
            .names
            .get(placeholder)
            .cloned()
            .ok_or_else(|| invalid(format!("undefined name placeholder {placeholder}")))
    }

    fn value(&self, placeholder: &str) -> StoreResult<AttributeValue> {
        self.attributes
            .values
            .get(placeholder)
            .cloned()
            .ok_or_else(|| invalid(format!("undefined value placeholder {placeholder}")))
    }

    fn path(&mut self) -> StoreResult<String> {
        match self.next()? {
            Token::Name(placeholder) => self.name(&placeholder),
            Token::Ident(field) => Ok(field),
            other => Err(invalid(format!("expected an attribute path, found {other:?}"))),
        }
    }

    fn literal(&mut self) -> StoreResult<AttributeValue> {
        match self.next()? {
            Token::Value(placeholder) => self.value(&placeholder),
            other => Err(invalid(format!("expected a value placeholder, found {other:?}"))),
        }
    }

    fn operand(&mut self) -> StoreResult<Operand> {
        if matches!(self.peek(), Some(Token::Ident(word)) if word == "size")
            && self.peek_at(1) == Some(&Token::LParen)
        {
            self.pos += 2;
            let field = self.path()?;
            self.expect(&Token::RParen)?;
            return Ok(Operand::Size(field));
        }
        match self.peek() {
            Some(Token::Value(_)) => Ok(Operand::Value(self.literal()?)),
            _ => Ok(Operand::Path(self.path()?)),
        }
    }

    fn or(&mut self) -> StoreResult<Condition> {
        let mut left = self.and()?;
        while self.at_keyword("OR") {
            self.pos += 1;
            left = Condition::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> StoreResult<Condition> {
        let mut left = self.not()?;
        while self.at_keyword("AND") {
            self.pos += 1;
            left = Condition::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> StoreResult<Condition> {
        if self.at_keyword("NOT") {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.not()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> StoreResult<Condition> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        if let Some(Token::Ident(word)) = self.peek()
            && self.peek_at(1) == Some(&Token::LParen)
        {
            let function = word.clone();
            match function.as_str() {
                "attribute_exists" | "attribute_not_exists" => {
                    self.pos += 2;
                    let field = self.path()?;
                    self.expect(&Token::RParen)?;
                    return Ok(if function == "attribute_exists" {
                        Condition::Exists(field)
                    } else {
                        Condition::NotExists(field)
                    });
                },
                "begins_with" | "contains" => {
                    self.pos += 2;
                    let subject = self.operand()?;
                    self.expect(&Token::Comma)?;
                    let argument = self.operand()?;
                    self.expect(&Token::RParen)?;
                    return Ok(if function == "begins_with" {
                        Condition::BeginsWith(subject, argument)
                    } else {
                        Condition::Contains(subject, argument)
                    });
                },
                _ => {},
            }
        }

        let left = self.operand()?;
        if self.at_keyword("BETWEEN") {
            self.pos += 1;
            let low = self.operand()?;
            if !self.at_keyword("AND") {
                return Err(invalid("BETWEEN without AND"));
            }
            self.pos += 1;
            let high = self.operand()?;
            return Ok(Condition::Between(left, low, high));
        }
        if self.at_keyword("IN") {
            self.pos += 1;
            self.expect(&Token::LParen)?;
            let mut candidates = vec![self.operand()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                candidates.push(self.operand()?);
            }
            self.expect(&Token::RParen)?;
            return Ok(Condition::In(left, candidates));
        }
        let comparator = match self.next()? {
            Token::Eq => Comparator::Eq,
            Token::Ne => Comparator::Ne,
            Token::Lt => Comparator::Lt,
            Token::Le => Comparator::Le,
            Token::Gt => Comparator::Gt,
            Token::Ge => Comparator::Ge,
            other => return Err(invalid(format!("expected a comparator, found {other:?}"))),
        };
        Ok(Condition::Compare(left, comparator, self.operand()?))
    }

    fn at_section(&self) -> bool {
        ["SET", "REMOVE", "ADD", "DELETE"].iter().any(|k| self.at_keyword(k))
    }

    fn value_expr(&mut self) -> StoreResult<ValueExpr> {
        let left = self.value_term()?;
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                Ok(ValueExpr::Plus(Box::new(left), Box::new(self.value_term()?)))
            },
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(ValueExpr::Minus(Box::new(left), Box::new(self.value_term()?)))
            },
            _ => Ok(left),
        }
    }

    fn value_term(&mut self) -> StoreResult<ValueExpr> {
        if let Some(Token::Ident(word)) = self.peek()
            && self.peek_at(1) == Some(&Token::LParen)
        {
            match word.as_str() {
                "if_not_exists" => {
                    self.pos += 2;
                    let field = self.path()?;
                    self.expect(&Token::Comma)?;
                    let fallback = self.value_expr()?;
                    self.expect(&Token::RParen)?;
                    return Ok(ValueExpr::IfNotExists(field, Box::new(fallback)));
                },
                "list_append" => {
                    self.pos += 2;
                    let a = self.value_expr()?;
                    self.expect(&Token::Comma)?;
                    let b = self.value_expr()?;
                    self.expect(&Token::RParen)?;
                    return Ok(ValueExpr::ListAppend(Box::new(a), Box::new(b)));
                },
                _ => {},
            }
        }
        Ok(ValueExpr::Operand(self.operand()?))
    }

    fn update(&mut self) -> StoreResult<UpdateExpression> {
        let mut update = UpdateExpression::default();
        while self.peek().is_some() {
            let Token::Ident(section) = self.next()? else {
                return Err(invalid("expected SET, REMOVE, ADD or DELETE"));
            };
            loop {
                match section.to_ascii_uppercase().as_str() {
                    "SET" => {
                        let field = self.path()?;
                        self.expect(&Token::Eq)?;
                        update.set.push((field, self.value_expr()?));
                    },
                    "REMOVE" => update.remove.push(self.path()?),
                    "ADD" => {
                        let field = self.path()?;
                        update.add.push((field, self.literal()?));
                    },
                    "DELETE" => {
                        let field = self.path()?;
                        update.delete.push((field, self.literal()?));
                    },
                    other => return Err(invalid(format!("unknown update section {other}"))),
                }
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
            if self.peek().is_some() && !self.at_section() {
                return Err(invalid(format!("unexpected {:?} in update expression", self.peek())));
            }
        }
        Ok(update)
    }
}

/// Parses a condition, key condition, or filter expression.
pub(crate) fn parse_condition(input: &str, attributes: &ExpressionAttributes) -> StoreResult<Condition> {
    let mut parser = Parser::new(input, attributes)?;
    let condition = parser.or()?;
    parser.finish()?;
    Ok(condition)
}

/// Parses an update expression.
pub(crate) fn parse_update(input: &str, attributes: &ExpressionAttributes) -> StoreResult<UpdateExpression> {
    let mut parser = Parser::new(input, attributes)?;
    let update = parser.update()?;
    parser.finish()?;
    Ok(update)
}
