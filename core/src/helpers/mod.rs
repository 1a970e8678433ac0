use std::borrow::Cow;

pub fn camel_to_snake(s: &str) -> String {
    camel_to_snake_advanced(s, false)
}

pub fn camel_to_snake_advanced(s: &str, numbers_attach_to_last_word: bool) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut snake_case = String::with_capacity(s.len() + 4);
    let mut previous_was_uppercase = false;
    let mut previous_was_digit = false;
    let mut uppercase_sequence_length = 0;

    for (i, c) in chars.iter().copied().enumerate() {
        if !(c.is_alphanumeric() || c == '_') {
            continue;
        }

        if c.is_uppercase() {
            let next_is_lowercase = chars.get(i + 1).is_some_and(|next| next.is_lowercase());
            if i > 0 && !snake_case.ends_with('_') && (!previous_was_uppercase || next_is_lowercase)
            {
                snake_case.push('_');
            }
            snake_case.extend(c.to_lowercase());
            previous_was_uppercase = true;
            previous_was_digit = false;
            uppercase_sequence_length += 1;
        } else if c.is_ascii_digit() {
            if !numbers_attach_to_last_word
                && i > 0
                && !previous_was_digit
                && !snake_case.ends_with('_')
                && uppercase_sequence_length != 1
            {
                snake_case.push('_');
            }
            snake_case.push(c);
            previous_was_uppercase = false;
            previous_was_digit = true;
            uppercase_sequence_length = 0;
        } else {
            snake_case.push(c);
            previous_was_uppercase = false;
            previous_was_digit = false;
            uppercase_sequence_length = 0;
        }
    }

    snake_case
}

/// Shortens SQL text for log lines, a multi-row insert can be megabytes long.
pub fn sql_preview(sql: &str, max_chars: usize) -> Cow<'_, str> {
    match sql.char_indices().nth(max_chars) {
        None => Cow::Borrowed(sql),
        Some((cut, _)) => {
            Cow::Owned(format!("{}... ({} more bytes)", &sql[..cut], sql.len() - cut))
        }
    }
}
