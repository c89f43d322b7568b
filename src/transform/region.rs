/// Outcome of splitting a composite region field like
/// `"Scarborough-Agincourt (20)"`. Produced on every input; there is no path
/// that leaves either half undefined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionParse {
    Parsed { name: String, id: i8 },
    Missing,
}

/// Splits `raw` at the first `(`: the text before it (minus one trailing
/// space) is the region name, the two characters after it are the numeric
/// region code. No `(`, an empty name, or a code that is not two digits all
/// collapse to [`RegionParse::Missing`].
pub fn parse(raw: &str) -> RegionParse {
    let Some(open) = raw.find('(') else {
        return RegionParse::Missing;
    };

    let name = raw[..open].strip_suffix(' ').unwrap_or(&raw[..open]);
    if name.is_empty() {
        return RegionParse::Missing;
    }

    // Fixed two-character code width, as published by the portal.
    let code: String = raw[open + 1..].chars().take(2).collect();
    if code.len() != 2 {
        return RegionParse::Missing;
    }
    match code.parse::<i8>() {
        Ok(id) if id >= 0 => RegionParse::Parsed {
            name: name.to_string(),
            id,
        },
        _ => RegionParse::Missing,
    }
}
