//! Shape classification and value normalisation for Brazilian document
//! fields.
//!
//! Field descriptions are mapped to a shape hint through a fixed keyword
//! dictionary; extracted values are then normalised to the canonical
//! Brazilian rendering for that shape, or rejected (treated as missing).

use chrono::NaiveDate;

/// Recognised value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeHint {
    Cpf,
    Cnpj,
    Cep,
    Phone,
    Currency,
    Date,
    Integer,
    Text,
}

/// Keyword → shape dictionary, applied to the case-folded tokens of the
/// field name and description. First match wins.
const SHAPE_KEYWORDS: &[(&str, ShapeHint)] = &[
    ("cpf", ShapeHint::Cpf),
    ("cnpj", ShapeHint::Cnpj),
    ("cep", ShapeHint::Cep),
    ("telefone", ShapeHint::Phone),
    ("celular", ShapeHint::Phone),
    ("fone", ShapeHint::Phone),
    ("phone", ShapeHint::Phone),
    ("valor", ShapeHint::Currency),
    ("preco", ShapeHint::Currency),
    ("preço", ShapeHint::Currency),
    ("total", ShapeHint::Currency),
    ("r$", ShapeHint::Currency),
    ("data", ShapeHint::Date),
    ("date", ShapeHint::Date),
    ("emissao", ShapeHint::Date),
    ("emissão", ShapeHint::Date),
    ("vencimento", ShapeHint::Date),
    ("nascimento", ShapeHint::Date),
    ("numero", ShapeHint::Integer),
    ("número", ShapeHint::Integer),
    ("number", ShapeHint::Integer),
    ("inscricao", ShapeHint::Integer),
    ("inscrição", ShapeHint::Integer),
    ("quantidade", ShapeHint::Integer),
    ("codigo", ShapeHint::Integer),
    ("código", ShapeHint::Integer),
];

/// Derives the shape hint for a field from its name and description.
pub fn shape_hint(field_name: &str, description: &str) -> ShapeHint {
    let folded = format!("{} {}", field_name, description).to_lowercase();
    let tokens: Vec<&str> = folded
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '.' | ':'))
        .filter(|t| !t.is_empty())
        .collect();
    for (keyword, hint) in SHAPE_KEYWORDS {
        if tokens.iter().any(|t| t == keyword) {
            return *hint;
        }
    }
    ShapeHint::Text
}

/// Normalises `raw` according to `hint`. Returns `None` when the value
/// does not fit the shape; a rejected value counts as missing.
pub fn validate(hint: ShapeHint, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match hint {
        ShapeHint::Cpf => {
            let d = digits(raw);
            (d.len() == 11).then(|| {
                format!("{}.{}.{}-{}", &d[0..3], &d[3..6], &d[6..9], &d[9..11])
            })
        }
        ShapeHint::Cnpj => {
            let d = digits(raw);
            (d.len() == 14).then(|| {
                format!(
                    "{}.{}.{}/{}-{}",
                    &d[0..2],
                    &d[2..5],
                    &d[5..8],
                    &d[8..12],
                    &d[12..14]
                )
            })
        }
        ShapeHint::Cep => {
            let d = digits(raw);
            (d.len() == 8).then(|| format!("{}-{}", &d[0..5], &d[5..8]))
        }
        ShapeHint::Phone => {
            let mut d = digits(raw);
            // Strip a country prefix when the remainder is still a full
            // national number.
            if (d.len() == 12 || d.len() == 13) && d.starts_with("55") {
                d = d[2..].to_string();
            }
            match d.len() {
                10 => Some(format!("({}) {}-{}", &d[0..2], &d[2..6], &d[6..10])),
                11 => Some(format!("({}) {}-{}", &d[0..2], &d[2..7], &d[7..11])),
                _ => None,
            }
        }
        ShapeHint::Currency => parse_brl(raw).map(format_brl),
        ShapeHint::Date => parse_date(raw).map(|d| d.format("%d/%m/%Y").to_string()),
        ShapeHint::Integer => {
            let d = digits(raw);
            (!d.is_empty()).then_some(d)
        }
        ShapeHint::Text => Some(raw.to_string()),
    }
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Parses a pt-BR money rendering ("R$ 1.234,56", "1234,5", "1234") into
/// centavos.
fn parse_brl(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let (int_part, frac_part) = match cleaned.rsplit_once(',') {
        Some((int, frac)) => (int.replace('.', ""), frac.to_string()),
        // No decimal comma: dots are thousands separators unless the text
        // had no digits at all.
        None => (cleaned.replace('.', ""), String::new()),
    };
    if int_part.chars().any(|c| !c.is_ascii_digit())
        || frac_part.chars().any(|c| !c.is_ascii_digit())
        || frac_part.len() > 2
    {
        return None;
    }
    let units: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    let cents: i64 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().ok()? * 10,
        _ => frac_part.parse().ok()?,
    };
    Some(units * 100 + cents)
}

fn format_brl(total_cents: i64) -> String {
    let units = total_cents / 100;
    let cents = total_cents % 100;
    let mut grouped = String::new();
    let digits = units.to_string();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    format!("R$ {grouped},{cents:02}")
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%d/%m/%y"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_follow_the_keyword_dictionary() {
        assert_eq!(shape_hint("cpf", "CPF do titular"), ShapeHint::Cpf);
        assert_eq!(shape_hint("doc", "CNPJ da empresa"), ShapeHint::Cnpj);
        assert_eq!(shape_hint("recepcao", "Setor de recepção"), ShapeHint::Text);
        assert_eq!(shape_hint("cep", "CEP do endereço"), ShapeHint::Cep);
        assert_eq!(shape_hint("contato", "Telefone de contato"), ShapeHint::Phone);
        assert_eq!(shape_hint("valor", "Valor da fatura"), ShapeHint::Currency);
        assert_eq!(shape_hint("emissao", "Data de emissão"), ShapeHint::Date);
        assert_eq!(
            shape_hint("inscricao", "Número de inscrição na OAB"),
            ShapeHint::Integer
        );
        assert_eq!(shape_hint("nome", "Nome completo"), ShapeHint::Text);
    }

    #[test]
    fn dados_does_not_trigger_the_date_hint() {
        assert_eq!(shape_hint("extras", "Dados complementares"), ShapeHint::Text);
    }

    #[test]
    fn cpf_normalisation() {
        assert_eq!(
            validate(ShapeHint::Cpf, "12345678900"),
            Some("123.456.789-00".to_string())
        );
        assert_eq!(
            validate(ShapeHint::Cpf, "CPF: 123.456.789-00"),
            Some("123.456.789-00".to_string())
        );
        assert_eq!(validate(ShapeHint::Cpf, "1234"), None);
    }

    #[test]
    fn cep_normalisation() {
        assert_eq!(
            validate(ShapeHint::Cep, "01310100"),
            Some("01310-100".to_string())
        );
        assert_eq!(validate(ShapeHint::Cep, "013101"), None);
    }

    #[test]
    fn phone_normalisation() {
        assert_eq!(
            validate(ShapeHint::Phone, "+55 (11) 98765-4321"),
            Some("(11) 98765-4321".to_string())
        );
        assert_eq!(
            validate(ShapeHint::Phone, "1133334444"),
            Some("(11) 3333-4444".to_string())
        );
        assert_eq!(validate(ShapeHint::Phone, "12345"), None);
    }

    #[test]
    fn currency_normalisation() {
        assert_eq!(
            validate(ShapeHint::Currency, "R$ 1.234,56"),
            Some("R$ 1.234,56".to_string())
        );
        assert_eq!(
            validate(ShapeHint::Currency, "1234,5"),
            Some("R$ 1.234,50".to_string())
        );
        assert_eq!(
            validate(ShapeHint::Currency, "980"),
            Some("R$ 980,00".to_string())
        );
        assert_eq!(validate(ShapeHint::Currency, "sem valor"), None);
    }

    #[test]
    fn date_normalisation() {
        assert_eq!(
            validate(ShapeHint::Date, "2024-03-05"),
            Some("05/03/2024".to_string())
        );
        assert_eq!(
            validate(ShapeHint::Date, "05/03/2024"),
            Some("05/03/2024".to_string())
        );
        assert_eq!(validate(ShapeHint::Date, "ontem"), None);
    }

    #[test]
    fn integer_and_text() {
        assert_eq!(
            validate(ShapeHint::Integer, "nº 123.456"),
            Some("123456".to_string())
        );
        assert_eq!(validate(ShapeHint::Integer, "nenhum"), None);
        assert_eq!(
            validate(ShapeHint::Text, "  João Silva  "),
            Some("João Silva".to_string())
        );
        assert_eq!(validate(ShapeHint::Text, "   "), None);
    }
}
