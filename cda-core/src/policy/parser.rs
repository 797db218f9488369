//! Recursive-descent parser from the rule-expression token stream to a
//! [`RuleExpr`] tree (§4.7).

use super::ast::RuleExpr;
use super::lexer::{self, Spanned, Token};
use crate::error::PolicyError;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.offset)
            .unwrap_or_else(|| self.tokens.last().map(|s| s.offset + 1).unwrap_or(0))
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// `or := and ('OR' and)*`
    fn parse_or(&mut self) -> Result<RuleExpr, PolicyError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = RuleExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// `and := unary ('AND' unary)*`
    fn parse_and(&mut self) -> Result<RuleExpr, PolicyError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = RuleExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// `unary := 'thingName' ':' ident`
    fn parse_unary(&mut self) -> Result<RuleExpr, PolicyError> {
        let offset = self.offset();
        match self.advance() {
            Some(Spanned { token: Token::ThingName, .. }) => {}
            _ => {
                return Err(PolicyError::Parse {
                    offset,
                    message: "expected 'thingName'".to_string(),
                })
            }
        }

        let offset = self.offset();
        match self.advance() {
            Some(Spanned { token: Token::Colon, .. }) => {}
            _ => {
                return Err(PolicyError::Parse {
                    offset,
                    message: "expected ':' after 'thingName'".to_string(),
                })
            }
        }

        let offset = self.offset();
        match self.advance() {
            Some(Spanned { token: Token::Ident(ident), .. }) => Ok(RuleExpr::ThingName(ident)),
            _ => Err(PolicyError::Parse {
                offset,
                message: "expected identifier after ':'".to_string(),
            }),
        }
    }
}

/// Parses a complete rule expression (`start := or`).
pub fn parse(input: &str) -> Result<RuleExpr, PolicyError> {
    let tokens = lexer::lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(PolicyError::Parse {
            offset: parser.offset(),
            message: "unexpected trailing tokens".to_string(),
        });
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_unary() {
        let expr = parse("thingName:sensor-1").unwrap();
        assert_eq!(expr, RuleExpr::ThingName("sensor-1".to_string()));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a AND b OR c  ==  (a AND b) OR c
        let expr = parse("thingName:a AND thingName:b OR thingName:c").unwrap();
        let expected = RuleExpr::Or(
            Box::new(RuleExpr::And(
                Box::new(RuleExpr::ThingName("a".to_string())),
                Box::new(RuleExpr::ThingName("b".to_string())),
            )),
            Box::new(RuleExpr::ThingName("c".to_string())),
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn left_associative_or_chain() {
        let expr = parse("thingName:a OR thingName:b OR thingName:c").unwrap();
        let expected = RuleExpr::Or(
            Box::new(RuleExpr::Or(
                Box::new(RuleExpr::ThingName("a".to_string())),
                Box::new(RuleExpr::ThingName("b".to_string())),
            )),
            Box::new(RuleExpr::ThingName("c".to_string())),
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn missing_colon_is_a_parse_error() {
        let result = parse("thingName sensor-1");
        assert!(matches!(result, Err(PolicyError::Parse { .. })));
    }

    #[test]
    fn trailing_garbage_is_a_parse_error() {
        let result = parse("thingName:a thingName:b");
        assert!(result.is_err());
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        assert!(parse("").is_err());
    }
}
