use std::fmt::Display;

use super::{ErrorParam, ParseError, ERR_EALIGN, INITIAL_ORBIT, MAX_MULTIPOLE_ORDER};
use crate::simulator::Selection;

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        }
        _ => false,
    }
}

// element name, `#s`/`#e` or a `first/last` range of those
fn is_range(s: &str) -> bool {
    let bound = |s: &str| is_ident(s) || s == "#s" || s == "#e";
    match s.split_once('/') {
        Some((first, last)) => bound(first) && bound(last),
        None => bound(s),
    }
}

// `dkn3` -> ("dkn", 3)
fn multipole(attr: &str) -> Option<(&str, usize)> {
    ["dkn", "dks"].into_iter().find_map(|prefix| {
        attr.strip_prefix(prefix)
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|&n| n <= MAX_MULTIPOLE_ORDER)
            .map(|n| (prefix, n))
    })
}

impl ErrorParam {
    /// Parses an error spec
    ///
    /// A leading `δ` or a trailing `*` marks a relative error, a leading `Δ`
    /// an absolute one (the default).
    ///
    /// # Examples
    ///
    /// ```
    /// use ormfit::ErrorParam;
    ///
    /// assert_eq!(ErrorParam::parse("KQ1").unwrap(), ErrorParam::Global("kq1".into()));
    /// assert_eq!(
    ///     ErrorParam::parse("q1->k1*").unwrap(),
    ///     ErrorParam::ScaledElementAttr { elem: "q1".into(), attr: "k1".into() }
    /// );
    /// assert!(ErrorParam::parse("q1->").is_err());
    /// ```
    pub fn parse(spec: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidSpec(spec.into());
        let mut body = spec.trim();
        let mut relative = false;
        if let Some(rest) = body.strip_prefix('δ') {
            relative = true;
            body = rest;
        } else if let Some(rest) = body.strip_prefix('Δ') {
            body = rest;
        }
        if let Some(rest) = body.strip_suffix('*') {
            relative = true;
            body = rest;
        }
        let body = body.trim().to_lowercase();
        let fixed = |param: ErrorParam| {
            if relative {
                Err(ParseError::NotScalable(spec.into()))
            } else {
                Ok(param)
            }
        };

        if INITIAL_ORBIT.contains(&body.as_str()) {
            return fixed(ErrorParam::InitialOrbit(body));
        }
        if let Some(inner) = body.strip_suffix('>') {
            let (entity, attr) = inner.split_once('<').ok_or_else(invalid)?;
            let (entity, attr) = (entity.trim(), attr.trim());
            if !is_range(entity) {
                return Err(invalid());
            }
            let selection = Selection::range(entity);
            if ERR_EALIGN.contains(&attr) {
                return fixed(ErrorParam::Alignment {
                    selection,
                    attr: attr.into(),
                });
            }
            let (attr, n) = multipole(attr).ok_or_else(invalid)?;
            let mut values = vec![0f64; n + 1];
            values[n] = 1.;
            return fixed(ErrorParam::Field {
                selection,
                attr: attr.into(),
                values,
                order: None,
                radius: None,
            });
        }
        if let Some((elem, attr)) = body.split_once("->") {
            let (elem, attr) = (elem.trim(), attr.trim());
            if !(is_ident(elem) && is_ident(attr)) {
                return Err(invalid());
            }
            let (elem, attr) = (elem.into(), attr.into());
            return Ok(if relative {
                ErrorParam::ScaledElementAttr { elem, attr }
            } else {
                ErrorParam::ElementAttr { elem, attr }
            });
        }
        if is_ident(&body) {
            return Ok(if relative {
                ErrorParam::ScaledGlobal(body)
            } else {
                ErrorParam::Global(body)
            });
        }
        Err(invalid())
    }
}

impl std::str::FromStr for ErrorParam {
    type Err = ParseError;
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        Self::parse(spec)
    }
}

/// Writes the canonical spec string
impl Display for ErrorParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorParam::*;
        match self {
            Global(name) => write!(f, "{}", name),
            ScaledGlobal(name) => write!(f, "δ{}", name),
            ElementAttr { elem, attr } => write!(f, "{}->{}", elem, attr),
            ScaledElementAttr { elem, attr } => write!(f, "δ{}->{}", elem, attr),
            Alignment { selection, attr } => write!(f, "{}<{}>", selection.range, attr),
            Field {
                selection,
                attr,
                values,
                ..
            } => {
                let nonzero: Vec<usize> = values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v != 0.)
                    .map(|(i, _)| i)
                    .collect();
                match nonzero.as_slice() {
                    [n] if values[*n] == 1. => write!(f, "{}<{}{}>", selection.range, attr, n),
                    _ => write!(f, "{}<{}{:?}>", selection.range, attr, values),
                }
            }
            InitialOrbit(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals() {
        assert_eq!(ErrorParam::parse("kq1"), Ok(ErrorParam::Global("kq1".into())));
        assert_eq!(ErrorParam::parse("Δkq1"), Ok(ErrorParam::Global("kq1".into())));
        assert_eq!(
            ErrorParam::parse("δkq1"),
            Ok(ErrorParam::ScaledGlobal("kq1".into()))
        );
        assert_eq!(
            ErrorParam::parse(" k.q_1* "),
            Ok(ErrorParam::ScaledGlobal("k.q_1".into()))
        );
    }

    #[test]
    fn element_attributes() {
        assert_eq!(
            ErrorParam::parse("Q1->K1"),
            Ok(ErrorParam::ElementAttr {
                elem: "q1".into(),
                attr: "k1".into()
            })
        );
        assert_eq!(
            ErrorParam::parse("δb1->angle"),
            Ok(ErrorParam::ScaledElementAttr {
                elem: "b1".into(),
                attr: "angle".into()
            })
        );
    }

    #[test]
    fn alignments() {
        assert_eq!(
            ErrorParam::parse("q1<dx>"),
            Ok(ErrorParam::Alignment {
                selection: Selection::range("q1"),
                attr: "dx".into()
            })
        );
        assert_eq!(
            ErrorParam::parse("#s/#e<dtheta>"),
            Ok(ErrorParam::Alignment {
                selection: Selection::range("#s/#e"),
                attr: "dtheta".into()
            })
        );
        assert_eq!(
            ErrorParam::parse("δq1<dx>"),
            Err(ParseError::NotScalable("δq1<dx>".into()))
        );
    }

    #[test]
    fn fields() {
        assert_eq!(
            ErrorParam::parse("q1<dks2>"),
            Ok(ErrorParam::Field {
                selection: Selection::range("q1"),
                attr: "dks".into(),
                values: vec![0., 0., 1.],
                order: None,
                radius: None,
            })
        );
        match ErrorParam::parse("q1<dkn20>") {
            Ok(ErrorParam::Field { values, .. }) => assert_eq!(values.len(), 21),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn initial_orbit() {
        assert_eq!(ErrorParam::parse("PX"), Ok(ErrorParam::InitialOrbit("px".into())));
        assert!(ErrorParam::parse("y*").is_err());
    }

    #[test]
    fn invalid() {
        for spec in [
            "", "δ", "1kq", "q1->", "->k1", "q1<dz>", "q1<dkn>", "q1 dx>", "a b", "q1<dx",
            "q1<dkn21>", "q1<dks100000000000>", "q1<dkn18446744073709551615>",
            "q1<dkn99999999999999999999999>",
        ] {
            assert_eq!(
                ErrorParam::parse(spec),
                Err(ParseError::InvalidSpec(spec.into())),
                "{:?}",
                spec
            );
        }
    }

    #[test]
    fn display() {
        for spec in ["kq1", "δkq1", "q1->k1", "δq1->k1", "q1/q3<dpsi>", "b1<dkn0>", "x"] {
            assert_eq!(ErrorParam::parse(spec).unwrap().to_string(), spec);
        }
        assert_eq!(ErrorParam::parse("kq1*").unwrap().to_string(), "δkq1");
    }
}
