const TATWEEL: char = '\u{0640}';
const BARE_ALEF: char = '\u{0627}';
const LAM: char = '\u{0644}';

pub fn normalize(text: &str, strip_diacritics: bool) -> String {
    let mut out = String::with_capacity(text.len());

    for character in text.chars() {
        match expand_lam_alef(character) {
            Some(alef) => {
                push_folded(&mut out, LAM, strip_diacritics);
                push_folded(&mut out, alef, strip_diacritics);
            }
            None => push_folded(&mut out, character, strip_diacritics),
        }
    }

    normalize_whitespace(&out)
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

pub fn contains_diacritics(text: &str) -> bool {
    text.chars().any(is_diacritic)
}

fn push_folded(out: &mut String, character: char, strip_diacritics: bool) {
    if character == TATWEEL || is_format_char(character) || is_formatting_bracket(character) {
        return;
    }

    if strip_diacritics && is_diacritic(character) {
        return;
    }

    out.push(fold_letter(character, strip_diacritics));
}

/// Harakat, tanween, shadda, sukun, superscript alef and Quranic annotation marks.
fn is_diacritic(character: char) -> bool {
    matches!(
        character,
        '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{06D6}'..='\u{06ED}'
    )
}

fn is_format_char(character: char) -> bool {
    matches!(
        character,
        '\u{200B}'..='\u{200F}' | '\u{2060}' | '\u{FEFF}'
    )
}

fn is_formatting_bracket(character: char) -> bool {
    matches!(character, '{' | '}' | '\u{FD3E}' | '\u{FD3F}')
}

fn fold_letter(character: char, strip_diacritics: bool) -> char {
    match character {
        // alef wasla
        '\u{0671}' => BARE_ALEF,
        // alef with madda, hamza above, hamza below
        '\u{0622}' | '\u{0623}' | '\u{0625}' if strip_diacritics => BARE_ALEF,
        _ => character,
    }
}

fn expand_lam_alef(character: char) -> Option<char> {
    match character {
        '\u{FEF5}' | '\u{FEF6}' => Some('\u{0622}'),
        '\u{FEF7}' | '\u{FEF8}' => Some('\u{0623}'),
        '\u{FEF9}' | '\u{FEFA}' => Some('\u{0625}'),
        '\u{FEFB}' | '\u{FEFC}' => Some(BARE_ALEF),
        _ => None,
    }
}
