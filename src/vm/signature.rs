//! Parameter classification for the packers and unpackers.
use crate::{
    error::Fault,
    types::{Catalog, ElementType, MethodSignature, Type},
    value::{words_for, WORDS_PER_LONG, WORDS_PER_NATIVE_FLOAT, WORDS_PER_TYPED_REF, WORD_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Void,
    Primitive(ElementType),
    ClassRef,
    ValueType { size: usize },
    ByRef,
    /// Anything unrecognized travels as an object reference.
    Other,
}

impl ParamKind {
    /// Words this parameter takes on the interpreter stack.
    pub fn words(self) -> usize {
        match self {
            ParamKind::Void => 0,
            ParamKind::Primitive(e) => match e {
                ElementType::I8 | ElementType::U8 => WORDS_PER_LONG,
                ElementType::R4 | ElementType::R8 | ElementType::R => WORDS_PER_NATIVE_FLOAT,
                ElementType::TypedByRef => WORDS_PER_TYPED_REF,
                ElementType::I | ElementType::U => words_for(WORD_SIZE),
                _ => 1,
            },
            ParamKind::ClassRef | ParamKind::ByRef | ParamKind::Other => 1,
            ParamKind::ValueType { size } => words_for(size),
        }
    }

    /// Bytes of the value when stored natively at its declared width.
    pub fn native_size(self) -> usize {
        match self {
            ParamKind::Void => 0,
            ParamKind::Primitive(e) => e.size(),
            ParamKind::ClassRef | ParamKind::ByRef | ParamKind::Other => WORD_SIZE,
            ParamKind::ValueType { size } => size,
        }
    }

    pub fn native_align(self) -> usize {
        match self {
            ParamKind::Void => 1,
            ParamKind::ValueType { size } => size.next_power_of_two().clamp(1, WORD_SIZE),
            other => other.native_size().clamp(1, WORD_SIZE),
        }
    }
}

pub fn classify(catalog: &Catalog, ty: &Type) -> Result<ParamKind, Fault> {
    Ok(match ty {
        Type::Void => ParamKind::Void,
        Type::Primitive(e) => ParamKind::Primitive(*e),
        Type::Class(_) => ParamKind::ClassRef,
        Type::ValueType(c) => match catalog.enum_underlying(*c) {
            Some(underlying) => ParamKind::Primitive(underlying),
            None => ParamKind::ValueType {
                size: catalog
                    .size_of(ty)
                    .map_err(|e| Fault::TypeLoad(e.to_string()))?,
            },
        },
        Type::ByRef(_) => ParamKind::ByRef,
        Type::Pointer(_) | Type::Array(_) | Type::Generic(_) => ParamKind::Other,
    })
}

/// A signature with every parameter already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedSignature {
    pub has_this: bool,
    pub params: Vec<ParamKind>,
    pub ret: ParamKind,
}

impl ClassifiedSignature {
    pub fn classify(catalog: &Catalog, sig: &MethodSignature) -> Result<Self, Fault> {
        Ok(Self {
            has_this: sig.has_this,
            params: sig
                .params
                .iter()
                .map(|p| classify(catalog, p))
                .collect::<Result<_, _>>()?,
            ret: classify(catalog, &sig.ret)?,
        })
    }

    /// Words of the declared parameters, `this` excluded.
    pub fn param_words(&self) -> usize {
        self.params.iter().map(|p| p.words()).sum()
    }

    /// Words of the full argument list as the callee sees it.
    pub fn arg_words(&self) -> usize {
        self.param_words() + usize::from(self.has_this)
    }

    /// Word offset of declared parameter `index` from the start of the arguments.
    pub fn param_offset(&self, index: usize) -> usize {
        usize::from(self.has_this) + self.params[..index].iter().map(|p| p.words()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CatalogBuilder;

    #[test]
    fn test_value_type_words_round_up() {
        let mut b = CatalogBuilder::new();
        let small = b.define_value_type("Demo", "Small");
        b.add_field(small, "a", Type::Primitive(ElementType::U1));
        b.add_field(small, "b", Type::Primitive(ElementType::U1));
        b.add_field(small, "c", Type::Primitive(ElementType::U1));
        let wide = b.define_value_type("Demo", "Wide");
        for name in ["a", "b", "c"] {
            b.add_field(wide, name, Type::i8());
        }
        let color = b.define_enum("Demo", "Color", ElementType::U2);
        let catalog = b.build().unwrap();

        for class in [small, wide] {
            let kind = classify(&catalog, &Type::ValueType(class)).unwrap();
            let size = catalog.size_of(&Type::ValueType(class)).unwrap();
            assert_eq!(kind, ParamKind::ValueType { size });
            assert_eq!(kind.words(), size.div_ceil(WORD_SIZE));
        }
        assert_eq!(
            classify(&catalog, &Type::ValueType(color)).unwrap(),
            ParamKind::Primitive(ElementType::U2)
        );
    }

    #[test]
    fn test_fixed_word_counts() {
        assert_eq!(ParamKind::Primitive(ElementType::I8).words(), WORDS_PER_LONG);
        assert_eq!(ParamKind::Primitive(ElementType::TypedByRef).words(), WORDS_PER_TYPED_REF);
        assert_eq!(ParamKind::Primitive(ElementType::R4).words(), WORDS_PER_NATIVE_FLOAT);
        assert_eq!(ParamKind::Primitive(ElementType::I1).words(), 1);
    }

    #[test]
    fn test_complex_types_fall_back_to_references() {
        let catalog = CatalogBuilder::new().build().unwrap();
        let array = Type::Array(Box::new(Type::i4()));
        let byref = Type::ByRef(Box::new(Type::i4()));
        assert_eq!(classify(&catalog, &array).unwrap(), ParamKind::Other);
        assert_eq!(classify(&catalog, &byref).unwrap(), ParamKind::ByRef);

        let sig = ClassifiedSignature::classify(
            &catalog,
            &MethodSignature::instance(vec![Type::i8(), Type::i4()], Type::Void),
        )
        .unwrap();
        assert_eq!(sig.arg_words(), 1 + WORDS_PER_LONG + 1);
        assert_eq!(sig.param_offset(1), 1 + WORDS_PER_LONG);
    }
}
