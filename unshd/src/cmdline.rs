//! Command line tokenizer: `prog args | prog args < in > out`.

use std::path::PathBuf;

use crate::error::ParseError;

/// A parsed command line, read-only input to the spawner.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Command {
    /// One argv per pipeline stage, in order. Never contains an empty argv.
    pub stages: Vec<Vec<String>>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Command {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[derive(Debug, PartialEq)]
enum Tok {
    Word(String),
    Pipe,
    In,
    Out,
}

fn lex(line: &str) -> Result<Vec<Tok>, ParseError> {
    let mut toks = Vec::new();
    let mut word = String::new();
    // a quoted empty string is still a word
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '|' | '<' | '>' => {
                if in_word { toks.push(Tok::Word(std::mem::take(&mut word))); in_word = false; }
                toks.push(match c { '|' => Tok::Pipe, '<' => Tok::In, _ => Tok::Out });
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(q) => word.push(q),
                        None => return Err(ParseError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\')) => word.push(e),
                            Some(other) => { word.push('\\'); word.push(other); }
                            None => return Err(ParseError::UnterminatedQuote('"')),
                        },
                        Some(q) => word.push(q),
                        None => return Err(ParseError::UnterminatedQuote('"')),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_word { toks.push(Tok::Word(std::mem::take(&mut word))); in_word = false; }
            }
            c => { word.push(c); in_word = true; }
        }
    }
    if in_word { toks.push(Tok::Word(word)); }
    Ok(toks)
}

/// Splits a line into pipeline stages and the global `<`/`>` redirections.
/// A blank line yields a command with zero stages.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut cmd = Command::default();
    let mut current: Vec<String> = Vec::new();
    let mut toks = lex(line)?.into_iter();
    while let Some(tok) = toks.next() {
        match tok {
            Tok::Word(w) => current.push(w),
            Tok::Pipe => {
                if current.is_empty() { return Err(ParseError::EmptyStage); }
                cmd.stages.push(std::mem::take(&mut current));
            }
            Tok::In | Tok::Out => {
                let op = if tok == Tok::In { '<' } else { '>' };
                let target = match toks.next() {
                    Some(Tok::Word(w)) => PathBuf::from(w),
                    _ => return Err(ParseError::MissingTarget(op)),
                };
                let slot = if op == '<' { &mut cmd.input } else { &mut cmd.output };
                if slot.is_some() { return Err(ParseError::DuplicateRedirect(op)); }
                *slot = Some(target);
            }
        }
    }
    if current.is_empty() {
        if !cmd.stages.is_empty() || cmd.input.is_some() || cmd.output.is_some() {
            return Err(ParseError::EmptyStage);
        }
    } else {
        cmd.stages.push(current);
    }
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn blank_line_has_no_stages() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("  \t ").unwrap().is_empty());
    }

    #[test]
    fn pipeline_with_redirections() {
        let cmd = parse("sort -r < in.txt | uniq -c >out.txt").unwrap();
        assert_eq!(cmd.stages, vec![argv(&["sort", "-r"]), argv(&["uniq", "-c"])]);
        assert_eq!(cmd.input, Some(PathBuf::from("in.txt")));
        assert_eq!(cmd.output, Some(PathBuf::from("out.txt")));
    }

    #[test]
    fn operators_need_no_spaces() {
        let cmd = parse("echo foo|tr o 0").unwrap();
        assert_eq!(cmd.stages, vec![argv(&["echo", "foo"]), argv(&["tr", "o", "0"])]);
    }

    #[test]
    fn quotes_group_words() {
        let cmd = parse(r#"printf '%s|%s' "a b" "say \"hi\"" ''"#).unwrap();
        assert_eq!(cmd.stages, vec![argv(&["printf", "%s|%s", "a b", "say \"hi\"", ""])]);
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(parse("ls |"), Err(ParseError::EmptyStage));
        assert_eq!(parse("| ls"), Err(ParseError::EmptyStage));
        assert_eq!(parse("ls | | wc"), Err(ParseError::EmptyStage));
        assert_eq!(parse("> out"), Err(ParseError::EmptyStage));
        assert_eq!(parse("cat <"), Err(ParseError::MissingTarget('<')));
        assert_eq!(parse("cat > | wc"), Err(ParseError::MissingTarget('>')));
        assert_eq!(parse("cat > a > b"), Err(ParseError::DuplicateRedirect('>')));
        assert_eq!(parse("echo 'oops"), Err(ParseError::UnterminatedQuote('\'')));
        assert_eq!(parse("echo \"oops"), Err(ParseError::UnterminatedQuote('"')));
    }
}
