//! Reader for the routing service's `token="value"` responses.
//!
//! Values are read in order: each lookup starts where the previous value ended, so
//! `IP=` after `STB IP=` never re-matches the earlier attribute.

use crate::{Result, VcsError};

/// Sequential cursor over a response body.
#[derive(Debug)]
pub struct TokenCursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// The quoted value following the next occurrence of `token`.
    pub fn string(&mut self, token: &str) -> Result<&'a str> {
        let missing = || VcsError::parse_error("routing response", format!("no value for {}", token));

        let found = self.text[self.pos..].find(token).ok_or_else(missing)?;
        let after = self.pos + found + token.len();
        let open = self.text[after..].find('"').ok_or_else(missing)? + after + 1;
        let close = self.text[open..].find('"').ok_or_else(missing)? + open;

        self.pos = close;
        Ok(&self.text[open..close])
    }

    pub fn int(&mut self, token: &str) -> Result<i32> {
        let value = self.string(token)?;
        value
            .trim()
            .parse()
            .map_err(|_| VcsError::parse_error("routing response", format!("{} is not a number: {:?}", token, value)))
    }
}
