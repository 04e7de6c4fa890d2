//! The runtime helpers generated code calls, and the dynamic-language semantics they implement.

use super::{Runtime, SimError, simulator::Machine};
use crate::{
    compile::{
        CompiledCode,
        graph::IdentIdx,
        machine::abi::{
            ARG_FPRS, ARG_GPRS, CALL_FRAME_HEADER_SIZE, CellType, GenericArithOp,
            GenericCompareOp, HEADER_ARG_COUNT, HelperId, RET_FPR, RET_GPR, ThunkId,
            TYPE_FLAG_MASQUERADES_AS_UNDEFINED, thunk_address,
        },
    },
    runtime::heap::ArrayShape,
    value::JSValue,
};
use std::{cmp::Ordering, sync::Arc};

/// Convert `d` to an int32 the way the language's bitwise operators do: truncate, then wrap
/// modulo 2^32.
pub fn to_int32(d: f64) -> i32 {
    if !d.is_finite() {
        return 0;
    }
    let t = d.trunc() % 4294967296.0;
    let t = if t < 0.0 { t + 4294967296.0 } else { t };
    t as u64 as u32 as i32
}

fn parse_number(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() {
        return 0.0;
    }
    match s {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if s.starts_with("0x") || s.starts_with("0X") => u64::from_str_radix(&s[2..], 16)
            .map(|x| x as f64)
            .unwrap_or(f64::NAN),
        // Rust accepts spellings ("inf", "nan") that the language does not.
        _ if s.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => s.parse::<f64>().unwrap_or(f64::NAN),
    }
}

fn number_to_string(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_owned()
    } else if d.is_infinite() {
        if d > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else if d == 0.0 {
        "0".to_owned()
    } else {
        format!("{d}")
    }
}

impl Runtime {
    pub fn to_number(&self, v: JSValue) -> Result<f64, SimError> {
        if let Some(d) = v.as_number() {
            return Ok(d);
        }
        if let Some(b) = v.as_boolean() {
            return Ok(if b { 1.0 } else { 0.0 });
        }
        if v.is_null() {
            return Ok(0.0);
        }
        if self.is_string(v) {
            return Ok(parse_number(&self.string_value(v)?));
        }
        Ok(f64::NAN)
    }

    pub fn to_boolean(&self, v: JSValue) -> Result<bool, SimError> {
        if let Some(i) = v.as_int32() {
            return Ok(i != 0);
        }
        if let Some(d) = v.as_double() {
            return Ok(d != 0.0 && !d.is_nan());
        }
        if let Some(b) = v.as_boolean() {
            return Ok(b);
        }
        if !v.is_cell() {
            return Ok(false);
        }
        if self.is_string(v) {
            return Ok(!self.string_units(v)?.is_empty());
        }
        Ok(self.type_flags(v)? & TYPE_FLAG_MASQUERADES_AS_UNDEFINED == 0)
    }

    pub fn to_js_string(&self, v: JSValue) -> Result<String, SimError> {
        if let Some(i) = v.as_int32() {
            return Ok(i.to_string());
        }
        if let Some(d) = v.as_double() {
            return Ok(number_to_string(d));
        }
        if let Some(b) = v.as_boolean() {
            return Ok(b.to_string());
        }
        if v.is_null() {
            return Ok("null".to_owned());
        }
        if v.is_undefined() || v.is_empty() {
            return Ok("undefined".to_owned());
        }
        match self.cell_type(v)? {
            CellType::String => self.string_value(v),
            CellType::Function => Ok("function".to_owned()),
            _ => Ok("[object Object]".to_owned()),
        }
    }

    /// Is `v` `null`, `undefined`, or an object masquerading as `undefined`?
    fn is_undefined_like(&self, v: JSValue) -> Result<bool, SimError> {
        if v.is_undefined_or_null() {
            return Ok(true);
        }
        Ok(v.is_cell() && self.type_flags(v)? & TYPE_FLAG_MASQUERADES_AS_UNDEFINED != 0)
    }

    pub fn strict_eq(&self, a: JSValue, b: JSValue) -> Result<bool, SimError> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(x == y);
        }
        if self.is_string(a) && self.is_string(b) {
            return Ok(self.string_units(a)? == self.string_units(b)?);
        }
        Ok(a == b)
    }

    pub fn loose_eq(&self, a: JSValue, b: JSValue) -> Result<bool, SimError> {
        let (au, bu) = (self.is_undefined_like(a)?, self.is_undefined_like(b)?);
        if au || bu {
            return Ok(au && bu);
        }
        if a.is_cell() && b.is_cell() && !(self.is_string(a) && self.is_string(b)) {
            return Ok(a == b);
        }
        if self.is_string(a) && self.is_string(b) {
            return self.strict_eq(a, b);
        }
        if (a.is_cell() && !self.is_string(a)) || (b.is_cell() && !self.is_string(b)) {
            // Objects have no primitive conversion here.
            return Ok(false);
        }
        Ok(self.to_number(a)? == self.to_number(b)?)
    }

    fn compare(&self, a: JSValue, b: JSValue, op: GenericCompareOp) -> Result<bool, SimError> {
        let ord = if self.is_string(a) && self.is_string(b) {
            Some(self.string_units(a)?.cmp(&self.string_units(b)?))
        } else {
            self.to_number(a)?.partial_cmp(&self.to_number(b)?)
        };
        Ok(match op {
            GenericCompareOp::Less => ord == Some(Ordering::Less),
            GenericCompareOp::LessEq => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            GenericCompareOp::Greater => ord == Some(Ordering::Greater),
            GenericCompareOp::GreaterEq => {
                matches!(ord, Some(Ordering::Greater | Ordering::Equal))
            }
            GenericCompareOp::Eq => self.loose_eq(a, b)?,
            GenericCompareOp::StrictEq => self.strict_eq(a, b)?,
        })
    }

    pub fn value_add(&mut self, a: JSValue, b: JSValue) -> Result<JSValue, SimError> {
        if self.is_string(a) || self.is_string(b) {
            let s = self.to_js_string(a)? + &self.to_js_string(b)?;
            return self.new_string(&s);
        }
        Ok(JSValue::number(self.to_number(a)? + self.to_number(b)?))
    }

    fn value_arith(&self, a: JSValue, b: JSValue, op: GenericArithOp) -> Result<JSValue, SimError> {
        let x = self.to_number(a)?;
        let y = self.to_number(b)?;
        Ok(JSValue::number(match op {
            GenericArithOp::Sub => x - y,
            GenericArithOp::Mul => x * y,
            GenericArithOp::Div => x / y,
            GenericArithOp::Mod => x % y,
            GenericArithOp::Negate => -x,
        }))
    }

    fn get_by_id_generic(&mut self, base: JSValue, name: &str) -> Result<JSValue, SimError> {
        if base.is_undefined_or_null() {
            self.throw_type_error(&format!("cannot read property '{name}' of {base}"))?;
            return Ok(JSValue::UNDEFINED);
        }
        if !base.is_cell() {
            return Ok(JSValue::UNDEFINED);
        }
        self.get_property(base, name)
    }

    fn put_by_id_generic(
        &mut self,
        base: JSValue,
        name: &str,
        value: JSValue,
    ) -> Result<(), SimError> {
        if base.is_undefined_or_null() {
            return self.throw_type_error(&format!("cannot set property '{name}' of {base}"));
        }
        if !base.is_cell() || self.is_string(base) {
            return Ok(());
        }
        self.put_property(base, name, value)
    }

    /// Move the frame at `frame` down so that it has room for every declared parameter, padding
    /// the missing ones with `undefined`. Returns the new frame, or 0 if there is no room.
    fn arity_fixup(&mut self, frame: u64, code: &CompiledCode) -> Result<u64, SimError> {
        let argc = self.mem.read_u64(frame + HEADER_ARG_COUNT as u64 * 8)?;
        let nparams = code.code_block().num_parameters as u64;
        if argc >= nparams {
            return Ok(frame);
        }
        let missing = nparams - argc;
        let nf = frame - missing * 8;
        let limit = self.stack_limit()?;
        if nf - code.frame_slots() as u64 * 8 < limit {
            self.stack_overflow()?;
            return Ok(0);
        }
        for i in 0..(CALL_FRAME_HEADER_SIZE as u64 + argc) {
            let v = self.mem.read_u64(frame + i * 8)?;
            self.mem.write_u64(nf + i * 8, v)?;
        }
        for i in argc..nparams {
            self.mem.write_u64(
                nf + (CALL_FRAME_HEADER_SIZE as u64 + i) * 8,
                JSValue::UNDEFINED.bits(),
            )?;
        }
        self.mem.write_u64(nf + HEADER_ARG_COUNT as u64 * 8, nparams)?;
        Ok(nf)
    }

    pub(super) fn stack_overflow(&mut self) -> Result<(), SimError> {
        let s = self.new_string("RangeError: Maximum call stack size exceeded")?;
        self.set_exception(s)
    }

    fn switch_imm(&self, code: &CompiledCode, table: usize, v: JSValue) -> Option<u64> {
        let key = v.as_int32().or_else(|| {
            v.as_double()
                .filter(|d| d.fract() == 0.0 && *d >= f64::from(i32::MIN) && *d <= f64::from(i32::MAX))
                .map(|d| d as i32)
        });
        key.and_then(|k| code.code_block().imm_target(table, k))
            .or_else(|| code.code_block().tables().imm.get(table).map(|t| t.default))
    }

    fn switch_string(
        &self,
        code: &CompiledCode,
        table: usize,
        v: JSValue,
    ) -> Result<Option<u64>, SimError> {
        if self.is_string(v) {
            return Ok(code.code_block().string_target(table, &self.string_value(v)?));
        }
        Ok(code.code_block().tables().string.get(table).map(|t| t.default))
    }

    fn identifier(code: &CompiledCode, imm: u64) -> Result<Arc<str>, SimError> {
        code.graph()
            .identifiers
            .get(IdentIdx::from_usize(imm as usize))
            .cloned()
            .ok_or_else(|| SimError::Unsupported(format!("no identifier {imm}")))
    }

    /// Run helper `h` against the machine state `m`, on behalf of `code`.
    pub(super) fn run_helper(
        &mut self,
        h: HelperId,
        m: &mut Machine,
        code: &Arc<CompiledCode>,
    ) -> Result<(), SimError> {
        let args = ARG_GPRS.map(|r| m.gpr(r));
        let arg = |i: usize| args[i];
        let js = |i: usize| JSValue::from_bits(arg(i));
        let ret = match h {
            HelperId::ValueAdd => self.value_add(js(0), js(1))?.bits(),
            HelperId::ValueArith => {
                let op = u8::try_from(arg(2))
                    .ok()
                    .and_then(GenericArithOp::from_repr)
                    .ok_or_else(|| SimError::Unsupported(format!("arith op {}", arg(2))))?;
                self.value_arith(js(0), js(1), op)?.bits()
            }
            HelperId::FMod => {
                let r = m.fpr(ARG_FPRS[0]) % m.fpr(ARG_FPRS[1]);
                m.set_fpr(RET_FPR, r);
                return Ok(());
            }
            HelperId::ToInt32 => u64::from(to_int32(m.fpr(ARG_FPRS[0])) as u32),
            HelperId::ToInt32Generic => u64::from(to_int32(self.to_number(js(0))?) as u32),
            HelperId::CompareGeneric => {
                let op = u8::try_from(arg(2))
                    .ok()
                    .and_then(GenericCompareOp::from_repr)
                    .ok_or_else(|| SimError::Unsupported(format!("compare op {}", arg(2))))?;
                u64::from(self.compare(js(0), js(1), op)?)
            }
            HelperId::ToBoolean => u64::from(self.to_boolean(js(0))?),
            HelperId::EnsureContiguous => {
                u64::from(self.ensure_shape(js(0), ArrayShape::Contiguous)?)
            }
            HelperId::EnsureDouble => u64::from(self.ensure_shape(js(0), ArrayShape::Double)?),
            HelperId::GetById | HelperId::GetByIdGeneric => {
                let name = Self::identifier(code, arg(1))?;
                self.get_by_id_generic(js(0), &name)?.bits()
            }
            HelperId::PutById => {
                let name = Self::identifier(code, arg(1))?;
                self.put_by_id_generic(js(0), &name, js(2))?;
                0
            }
            HelperId::SwitchImm => self
                .switch_imm(code, arg(0) as usize, js(1))
                .ok_or_else(|| SimError::Unsupported(format!("no jump table {}", arg(0))))?,
            HelperId::SwitchString => self
                .switch_string(code, arg(0) as usize, js(1))?
                .ok_or_else(|| SimError::Unsupported(format!("no jump table {}", arg(0))))?,
            HelperId::SingleCharacterString => {
                let c = arg(0) as u16;
                match self.single_char_string(c)? {
                    Some(s) => s.bits(),
                    None => self.new_string_from_units(&[c])?.bits(),
                }
            }
            HelperId::StackOverflow => {
                self.stack_overflow()?;
                0
            }
            HelperId::ArityFixup => self.arity_fixup(arg(0), code)?,
            HelperId::LookupExceptionHandler | HelperId::LookupExceptionHandlerFromCaller => {
                thunk_address(ThunkId::Throw)
            }
            HelperId::Throw => {
                self.set_exception(js(0))?;
                0
            }
        };
        m.set_gpr(RET_GPR, ret);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int32_conversion() {
        assert_eq!(to_int32(1.9), 1);
        assert_eq!(to_int32(-1.9), -1);
        assert_eq!(to_int32(2147483648.0), i32::MIN);
        assert_eq!(to_int32(4294967297.0), 1);
        assert_eq!(to_int32(-4294967297.0), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(1e20), 1661992960);
    }

    #[test]
    fn conversions_and_equality() {
        let mut rt = Runtime::new().unwrap();
        let s12 = rt.new_string(" 12 ").unwrap();
        let empty = rt.new_string("").unwrap();
        assert_eq!(rt.to_number(s12).unwrap(), 12.0);
        assert_eq!(rt.to_number(empty).unwrap(), 0.0);
        assert!(rt.to_number(JSValue::UNDEFINED).unwrap().is_nan());
        assert!(!rt.to_boolean(empty).unwrap());
        assert!(!rt.to_boolean(JSValue::double(f64::NAN)).unwrap());
        assert!(rt.to_boolean(s12).unwrap());

        assert!(rt.loose_eq(JSValue::NULL, JSValue::UNDEFINED).unwrap());
        assert!(!rt.strict_eq(JSValue::NULL, JSValue::UNDEFINED).unwrap());
        assert!(rt.loose_eq(s12, JSValue::int32(12)).unwrap());
        assert!(rt.strict_eq(JSValue::int32(3), JSValue::double(3.0)).unwrap());
        assert!(!rt
            .strict_eq(JSValue::double(f64::NAN), JSValue::double(f64::NAN))
            .unwrap());

        let o = rt.new_object(JSValue::NULL).unwrap();
        assert!(rt.to_boolean(o).unwrap());
        rt.make_masquerader(o).unwrap();
        assert!(!rt.to_boolean(o).unwrap());
        assert!(rt.loose_eq(o, JSValue::UNDEFINED).unwrap());
    }

    #[test]
    fn add_and_compare() {
        let mut rt = Runtime::new().unwrap();
        let a = rt.new_string("a").unwrap();
        let b = rt.new_string("b").unwrap();
        let ab = rt.value_add(a, JSValue::double(1.5)).unwrap();
        assert_eq!(rt.string_value(ab).unwrap(), "a1.5");
        assert_eq!(
            rt.value_add(JSValue::int32(1), JSValue::TRUE).unwrap(),
            JSValue::int32(2)
        );
        assert!(rt.compare(a, b, GenericCompareOp::Less).unwrap());
        assert!(!rt
            .compare(JSValue::double(f64::NAN), JSValue::int32(1), GenericCompareOp::GreaterEq)
            .unwrap());
        assert_eq!(
            rt.value_arith(JSValue::int32(7), JSValue::int32(2), GenericArithOp::Mod)
                .unwrap(),
            JSValue::int32(1)
        );
    }
}
