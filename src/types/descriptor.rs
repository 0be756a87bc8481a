use super::{ClassHierarchy, SimpleType};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Unexpected end of descriptor {0:?}")]
    UnexpectedEnd(String),

    #[error("Unexpected character {character:?} at offset {offset} in descriptor {descriptor:?}")]
    UnexpectedCharacter {
        descriptor: String,
        offset: usize,
        character: char,
    },

    #[error("Trailing characters in descriptor {0:?}")]
    TrailingCharacters(String),

    #[error("Parameter of type void in descriptor {0:?}")]
    VoidParameter(String),
}

/// Parameter and return types of a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodTypes {
    pub parameters: Vec<SimpleType>,
    pub return_type: SimpleType,
}

struct Parser<'a> {
    descriptor: &'a str,
    offset: usize,
    hierarchy: &'a dyn ClassHierarchy,
}

impl Parser<'_> {
    fn peek(&self) -> Result<char, DescriptorError> {
        self.descriptor[self.offset..]
            .chars()
            .next()
            .ok_or_else(|| DescriptorError::UnexpectedEnd(self.descriptor.to_string()))
    }

    fn unexpected(&self, character: char) -> DescriptorError {
        DescriptorError::UnexpectedCharacter {
            descriptor: self.descriptor.to_string(),
            offset: self.offset,
            character,
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), DescriptorError> {
        let character = self.peek()?;
        if character != expected {
            return Err(self.unexpected(character));
        }
        self.offset += character.len_utf8();
        Ok(())
    }

    fn parse_type(&mut self, allow_void: bool) -> Result<SimpleType, DescriptorError> {
        let character = self.peek()?;
        self.offset += character.len_utf8();
        Ok(match character {
            'Z' => SimpleType::Boolean,
            'B' => SimpleType::Byte,
            'C' => SimpleType::Char,
            'S' => SimpleType::Short,
            'I' => SimpleType::Int,
            'J' => SimpleType::Long,
            'F' => SimpleType::Float,
            'D' => SimpleType::Double,
            'V' if allow_void => SimpleType::Void,
            'V' => return Err(DescriptorError::VoidParameter(self.descriptor.to_string())),
            '[' => SimpleType::array(self.parse_type(false)?),
            'L' => {
                let rest = &self.descriptor[self.offset..];
                let Some(length) = rest.find(';') else {
                    return Err(DescriptorError::UnexpectedEnd(self.descriptor.to_string()));
                };
                let name = &rest[..length];
                if name.is_empty() {
                    return Err(self.unexpected(';'));
                }
                self.offset += length + 1;
                SimpleType::class(name, self.hierarchy)
            }
            _ => {
                self.offset -= character.len_utf8();
                return Err(self.unexpected(character));
            }
        })
    }

    fn finish(&self) -> Result<(), DescriptorError> {
        if self.offset == self.descriptor.len() {
            Ok(())
        } else {
            Err(DescriptorError::TrailingCharacters(self.descriptor.to_string()))
        }
    }
}

/// Parses a field descriptor such as `[Ljava/lang/String;`.
pub fn parse_field_descriptor(
    descriptor: &str,
    hierarchy: &dyn ClassHierarchy,
) -> Result<SimpleType, DescriptorError> {
    let mut parser = Parser {
        descriptor,
        offset: 0,
        hierarchy,
    };
    let ty = parser.parse_type(false)?;
    parser.finish()?;
    Ok(ty)
}

/// Parses a method descriptor such as `(IJ)V`.
pub fn parse_method_descriptor(
    descriptor: &str,
    hierarchy: &dyn ClassHierarchy,
) -> Result<MethodTypes, DescriptorError> {
    let mut parser = Parser {
        descriptor,
        offset: 0,
        hierarchy,
    };
    parser.expect('(')?;
    let mut parameters = Vec::new();
    while parser.peek()? != ')' {
        parameters.push(parser.parse_type(false)?);
    }
    parser.expect(')')?;
    let return_type = parser.parse_type(true)?;
    parser.finish()?;
    Ok(MethodTypes {
        parameters,
        return_type,
    })
}

/// Parses the operand of `checkcast`, `instanceof` and `anewarray`, which is either an internal
/// class name or an array descriptor.
pub fn parse_class_operand(
    operand: &str,
    hierarchy: &dyn ClassHierarchy,
) -> Result<SimpleType, DescriptorError> {
    if operand.starts_with('[') {
        parse_field_descriptor(operand, hierarchy)
    } else {
        Ok(SimpleType::class(operand, hierarchy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BasicHierarchy;

    #[test]
    fn fields() {
        let h = BasicHierarchy::new();
        assert_eq!(parse_field_descriptor("I", &h), Ok(SimpleType::Int));
        assert_eq!(
            parse_field_descriptor("[[J", &h),
            Ok(SimpleType::array(SimpleType::array(SimpleType::Long)))
        );
        assert_eq!(
            parse_field_descriptor("Ljava/lang/Runnable;", &h),
            Ok(SimpleType::class("java/lang/Runnable", &h))
        );
        assert!(matches!(
            parse_field_descriptor("V", &h),
            Err(DescriptorError::VoidParameter(_))
        ));
        assert!(matches!(
            parse_field_descriptor("II", &h),
            Err(DescriptorError::TrailingCharacters(_))
        ));
        assert!(matches!(
            parse_field_descriptor("Ljava/lang/String", &h),
            Err(DescriptorError::UnexpectedEnd(_))
        ));
    }

    #[test]
    fn methods() {
        let h = BasicHierarchy::new();
        let types = parse_method_descriptor("(IDLjava/lang/String;[Z)V", &h).unwrap();
        assert_eq!(
            types.parameters,
            vec![
                SimpleType::Int,
                SimpleType::Double,
                SimpleType::class("java/lang/String", &h),
                SimpleType::array(SimpleType::Boolean),
            ]
        );
        assert_eq!(types.return_type, SimpleType::Void);

        assert!(matches!(
            parse_method_descriptor("(V)V", &h),
            Err(DescriptorError::VoidParameter(_))
        ));
        assert!(matches!(
            parse_method_descriptor("(I", &h),
            Err(DescriptorError::UnexpectedEnd(_))
        ));
        assert!(matches!(
            parse_method_descriptor("I)V", &h),
            Err(DescriptorError::UnexpectedCharacter { offset: 0, .. })
        ));
    }

    #[test]
    fn class_operands() {
        let h = BasicHierarchy::new();
        assert_eq!(
            parse_class_operand("java/lang/String", &h),
            Ok(SimpleType::class("java/lang/String", &h))
        );
        assert_eq!(
            parse_class_operand("[I", &h),
            Ok(SimpleType::array(SimpleType::Int))
        );
    }
}
