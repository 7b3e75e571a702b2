use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // dot-atom local part @ (possibly internationalized) domain
    static ref BARE_ADDRESS: Regex =
        Regex::new(r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~.-]+@[^\s@]+\.[^\s@]+$").unwrap();
}

/// Sentinel domain returned when an address carries none.
pub const NULL_DOMAIN: &str = "localhost.localdomain";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Phrase(String),
    Email(String),
    Comment(String),
    Separator,
}

/// Tolerant tokenizer over an RFC 5322 address header value.
///
/// Quoted strings and unquoted runs become phrases, `<...>` becomes an
/// email, `(...)` a comment, `,` and `;` separators. Unterminated input is
/// preserved as a trailing comment and flagged as a parse error.
fn tokenize(input: &str) -> (Vec<Token>, bool) {
    let mut tokens = Vec::new();
    let mut error = false;
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            c if c.is_whitespace() => i += 1,
            ',' | ';' => {
                tokens.push(Token::Separator);
                i += 1;
            }
            '"' => {
                let mut phrase = String::new();
                let mut closed = false;
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            phrase.push(chars[i + 1]);
                            i += 2;
                        }
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        c => {
                            phrase.push(c);
                            i += 1;
                        }
                    }
                }
                if closed {
                    tokens.push(Token::Phrase(phrase));
                } else {
                    tokens.push(Token::Comment(phrase));
                    error = true;
                }
            }
            '<' => {
                // Terminates on '>', a group separator, or end of input;
                // the separator is left for the main loop.
                let mut email = String::new();
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '>' => {
                            i += 1;
                            break;
                        }
                        ',' | ';' => break,
                        c => {
                            email.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Email(email));
            }
            '(' => {
                let mut comment = String::new();
                let mut depth = 1;
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '(' => {
                            depth += 1;
                            comment.push('(');
                            i += 1;
                        }
                        ')' => {
                            depth -= 1;
                            i += 1;
                            if depth == 0 {
                                break;
                            }
                            comment.push(')');
                        }
                        '\\' if i + 1 < chars.len() => {
                            comment.push(chars[i + 1]);
                            i += 2;
                        }
                        c => {
                            comment.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Comment(comment));
                if depth != 0 {
                    error = true;
                }
            }
            _ => {
                let mut phrase = String::new();
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], ',' | ';' | '<' | '(' | '"')
                {
                    phrase.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Phrase(phrase));
            }
        }
    }
    (tokens, error)
}

fn clean_address(raw: &str) -> String {
    let mut addr = raw.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string();
    if addr.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("mailto:")) {
        addr = addr[7..].to_string();
    }
    // Whitespace around the @ is a common MUA artifact.
    if let Some(at) = addr.find('@') {
        let (local, domain) = addr.split_at(at);
        addr = format!("{}@{}", local.trim_end(), domain[1..].trim_start());
    }
    addr
}

/// Extract the addresses from a header value.
///
/// Between separators at most one email is accepted; a second email in the
/// same group flushes the first. A bare word is promoted to an email when
/// it looks like one and the group holds no explicit `<...>` address after
/// it. When nothing parses, the original string is returned as the single
/// element and a parse error is logged.
pub fn parse_addresses(input: &str) -> Vec<String> {
    let (tokens, mut error) = tokenize(input);

    let mut found: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    for (pos, token) in tokens.iter().enumerate() {
        match token {
            Token::Separator => {
                if let Some(addr) = current.take() {
                    found.push(addr);
                }
            }
            Token::Email(addr) => {
                if let Some(prev) = current.replace(addr.clone()) {
                    found.push(prev);
                }
            }
            Token::Phrase(word) if BARE_ADDRESS.is_match(word) => {
                let next_is_email = tokens[pos + 1..]
                    .iter()
                    .take_while(|t| !matches!(t, Token::Separator))
                    .any(|t| matches!(t, Token::Email(_)));
                if !next_is_email {
                    if let Some(prev) = current.replace(word.clone()) {
                        found.push(prev);
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(addr) = current.take() {
        found.push(addr);
    }

    if found.is_empty() {
        log::debug!("could not parse address from {input:?}");
        return vec![input.to_string()];
    }
    if error {
        log::debug!("malformed address input {input:?}");
    }

    found
        .iter()
        .map(|raw| clean_address(raw))
        .filter(|addr| !addr.ends_with("@unspecified-domain"))
        .collect()
}

/// Domain of the first address in a header value, lower-cased; the
/// `localhost.localdomain` sentinel when there is none.
pub fn get_domain_from(addr: &str) -> String {
    parse_addresses(addr)
        .first()
        .and_then(|a| a.rsplit_once('@'))
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|domain| !domain.is_empty())
        .unwrap_or_else(|| NULL_DOMAIN.to_string())
}

/// Registrable ("organizational") domain: the last two labels, widened for
/// well-known two-part public suffixes.
pub fn org_domain(domain: &str) -> String {
    const TWO_PART_TLDS: [&str; 17] = [
        "co.uk", "com.au", "co.jp", "co.kr", "com.br", "co.za", "com.mx", "co.in", "com.sg",
        "co.nz", "com.ar", "co.il", "org.uk", "net.au", "gov.uk", "ac.uk", "edu.au",
    ];
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() < 2 {
        return domain.to_string();
    }
    let last_two = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
    if parts.len() >= 3 && TWO_PART_TLDS.contains(&last_two.as_str()) {
        format!("{}.{}", parts[parts.len() - 3], last_two)
    } else {
        last_two
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_address() {
        assert_eq!(parse_addresses("alice@example.com"), vec!["alice@example.com"]);
    }

    #[test]
    fn display_name_and_angle_address() {
        assert_eq!(
            parse_addresses("Alice Example <alice@example.com>"),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn quoted_display_name_is_not_promoted() {
        assert_eq!(
            parse_addresses("\"alice@evil.example\" <alice@example.com>"),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn bare_word_before_angle_address_is_display_name() {
        assert_eq!(
            parse_addresses("bob@spoof.example <bob@example.com>"),
            vec!["bob@example.com"]
        );
    }

    #[test]
    fn comment_is_ignored() {
        assert_eq!(
            parse_addresses("alice@example.com (work account)"),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn multiple_addresses_split_on_separators() {
        assert_eq!(
            parse_addresses("a@example.com, B <b@example.net>; c@example.org"),
            vec!["a@example.com", "b@example.net", "c@example.org"]
        );
    }

    #[test]
    fn second_email_in_group_flushes_first() {
        assert_eq!(
            parse_addresses("<a@example.com> <b@example.com>"),
            vec!["a@example.com", "b@example.com"]
        );
    }

    #[test]
    fn mailto_and_spacing_artifacts_are_stripped() {
        assert_eq!(
            parse_addresses("<mailto:alice @ example.com>"),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn empty_input_falls_back_to_original() {
        assert_eq!(parse_addresses(""), vec![""]);
    }

    #[test]
    fn garbage_falls_back_to_original() {
        assert_eq!(parse_addresses("!!! not an address !!!"), vec!["!!! not an address !!!"]);
    }

    #[test]
    fn unspecified_domain_is_filtered() {
        assert!(parse_addresses("<a@unspecified-domain>").is_empty());
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(get_domain_from("Alice <Alice@Example.COM>"), "example.com");
        assert_eq!(get_domain_from(""), NULL_DOMAIN);
        assert_eq!(get_domain_from("no-at-sign"), NULL_DOMAIN);
    }

    #[test]
    fn round_trip_parse_of_emitted_address() {
        let parsed = parse_addresses("Alice Example <alice@example.com>");
        let emitted = format!("Alice Example <{}>", parsed[0]);
        assert_eq!(parse_addresses(&emitted), parsed);
    }

    #[test]
    fn org_domain_handles_two_part_tlds() {
        assert_eq!(org_domain("mail.example.com"), "example.com");
        assert_eq!(org_domain("mail.example.co.uk"), "example.co.uk");
        assert_eq!(org_domain("example.com"), "example.com");
        assert_eq!(org_domain("localhost"), "localhost");
    }
}
