// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

/// An ordered list of raw header lines, kept exactly as they were received
/// (minus the line terminator).
///
/// Used for the request headers (which are forwarded to the gateway as
/// `HTTP_*` variables) and for the header block of a gateway response (which
/// is forwarded to the client).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderLineList {
    lines: Vec<String>,
}

impl HeaderLineList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Removes every line whose field name is one of `names`.
    pub fn remove_named(&mut self, names: &[&str]) {
        self.lines.retain(|line| match split_field(line) {
            Some((field, _)) => !names.iter().any(|name| field.eq_ignore_ascii_case(name)),
            None => true,
        });
    }
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(lines: &[&str]) -> HeaderLineList {
        let mut list = HeaderLineList::new();
        for line in lines {
            list.push(*line);
        }
        list
    }

    #[test]
    fn keeps_insertion_order() {
        let list = list(&["B: 2", "A: 1", "C: 3"]);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["B: 2", "A: 1", "C: 3"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_named_ignores_case_and_padding() {
        let mut list = list(&["  CONNECTION :close", "X-Other: yes"]);
        list.remove_named(&["Connection"]);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["X-Other: yes"]);
    }

    #[test]
    fn remove_named_leaves_other_lines() {
        let mut list = list(&["Server: evil", "X-Kept: 1", "date: now", "garbage line"]);
        list.remove_named(&["Server", "Date"]);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["X-Kept: 1", "garbage line"]);
    }
}
