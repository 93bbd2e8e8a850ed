// src/rabbitmq/routing.rs
//! Topic exchange routing: dot-separated tokens, `*` matches exactly one
//! token and `#` matches zero or more.

/// Returns true when a message published with `routing_key` would be routed
/// through a binding declared with `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_tokens(&pattern, &key)
}

fn match_tokens(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Collapse consecutive hashes, then try every split point.
            if rest.first() == Some(&"#") {
                return match_tokens(rest, key);
            }
            (0..=key.len()).any(|skip| match_tokens(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_tokens(rest, &key[1..]),
        Some((token, rest)) => key.first() == Some(token) && match_tokens(rest, &key[1..]),
    }
}

/// AMQP short strings are limited to 255 bytes.
pub fn is_valid_routing_key(routing_key: &str) -> bool {
    routing_key.len() <= 255
}
