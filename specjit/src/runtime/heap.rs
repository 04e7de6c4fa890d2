//! The object model: structures, plain objects, arrays, strings, typed arrays and functions, laid
//! out in simulated memory as generated code expects to find them.

use super::{Function, Runtime, SimError, StructureInfo};
use crate::{
    compile::machine::abi::{
        BUTTERFLY_PUBLIC_LENGTH, BUTTERFLY_VECTOR_LENGTH, CELL_INLINE_STORAGE, CELL_LENGTH,
        CELL_SIZE, CELL_STORAGE, CELL_STRUCTURE, CellType, INDEXING_CONTIGUOUS, INDEXING_DOUBLE,
        INDEXING_IS_ARRAY, INDEXING_NONE, INDEXING_SHAPE_MASK, INLINE_CAPACITY, STRUCTURE_CELL_TYPE,
        STRUCTURE_ID, STRUCTURE_INDEXING_TYPE, STRUCTURE_PROTOTYPE, STRUCTURE_SIZE,
        STRUCTURE_TYPE_FLAGS, TYPE_FLAG_IMPLEMENTS_DEFAULT_HAS_INSTANCE,
        TYPE_FLAG_INTERCEPTS_INDEXING, TYPE_FLAG_MASQUERADES_AS_UNDEFINED,
    },
    value::JSValue,
};
use static_assertions::const_assert;
use std::sync::Arc;

const_assert!(CELL_SIZE % 8 == 0);
const_assert!(STRUCTURE_SIZE % 8 == 0);

/// The indexing shape of a butterfly-backed array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArrayShape {
    /// Boxed values; holes are the empty value.
    Contiguous,
    /// Raw doubles; holes are NaN.
    Double,
}

impl ArrayShape {
    fn indexing(self) -> u8 {
        match self {
            ArrayShape::Contiguous => INDEXING_CONTIGUOUS,
            ArrayShape::Double => INDEXING_DOUBLE,
        }
    }
}

impl Runtime {
    fn cell_addr(v: JSValue) -> Result<u64, SimError> {
        v.as_cell().ok_or(SimError::WrongType(v, "cell"))
    }

    pub(crate) fn new_structure(
        &mut self,
        cell_type: CellType,
        indexing: u8,
        flags: u8,
        prototype: JSValue,
        properties: Vec<Arc<str>>,
    ) -> Result<u64, SimError> {
        let s = self.mem.alloc(STRUCTURE_SIZE);
        let id = self.next_structure_id;
        self.next_structure_id += 1;
        self.mem.write_u32(s + STRUCTURE_ID as u64, id)?;
        self.mem.write_u8(s + STRUCTURE_CELL_TYPE as u64, cell_type as u8)?;
        self.mem.write_u8(s + STRUCTURE_INDEXING_TYPE as u64, indexing)?;
        self.mem.write_u8(s + STRUCTURE_TYPE_FLAGS as u64, flags)?;
        self.mem.write_u64(s + STRUCTURE_PROTOTYPE as u64, prototype.bits())?;
        self.structures.insert(s, StructureInfo { properties });
        Ok(s)
    }

    /// Copy `s`, changing its properties, indexing type, and flags.
    fn derive_structure(
        &mut self,
        s: u64,
        properties: Vec<Arc<str>>,
        indexing: u8,
        flags: u8,
    ) -> Result<u64, SimError> {
        let cell_type = self.structure_cell_type(s)?;
        let proto = JSValue::from_bits(self.mem.read_u64(s + STRUCTURE_PROTOTYPE as u64)?);
        self.new_structure(cell_type, indexing, flags, proto, properties)
    }

    fn new_cell(&mut self, structure: u64) -> Result<u64, SimError> {
        let c = self.mem.alloc(CELL_SIZE);
        self.mem.write_u64(c + CELL_STRUCTURE as u64, structure)?;
        Ok(c)
    }

    /// The structure of the cell `v`.
    pub fn structure_of(&self, v: JSValue) -> Result<u64, SimError> {
        self.mem
            .read_u64(Self::cell_addr(v)? + CELL_STRUCTURE as u64)
    }

    fn structure_cell_type(&self, s: u64) -> Result<CellType, SimError> {
        let ct = self.mem.read_u8(s + STRUCTURE_CELL_TYPE as u64)?;
        CellType::from_repr(ct).ok_or_else(|| SimError::Unsupported(format!("cell type {ct}")))
    }

    pub(crate) fn cell_type(&self, v: JSValue) -> Result<CellType, SimError> {
        self.structure_cell_type(self.structure_of(v)?)
    }

    pub(crate) fn indexing_type(&self, v: JSValue) -> Result<u8, SimError> {
        let s = self.structure_of(v)?;
        self.mem.read_u8(s + STRUCTURE_INDEXING_TYPE as u64)
    }

    pub(crate) fn type_flags(&self, v: JSValue) -> Result<u8, SimError> {
        let s = self.structure_of(v)?;
        self.mem.read_u8(s + STRUCTURE_TYPE_FLAGS as u64)
    }

    pub fn prototype_of(&self, v: JSValue) -> Result<JSValue, SimError> {
        let s = self.structure_of(v)?;
        Ok(JSValue::from_bits(
            self.mem.read_u64(s + STRUCTURE_PROTOTYPE as u64)?,
        ))
    }

    /// The inline slot holding property `name` in objects with structure `s`.
    pub fn slot_of(&self, s: u64, name: &str) -> Option<usize> {
        self.structures
            .get(&s)?
            .properties
            .iter()
            .position(|p| &**p == name)
    }

    /// A new, empty, plain object with prototype `proto` (a cell or `null`).
    pub fn new_object(&mut self, proto: JSValue) -> Result<JSValue, SimError> {
        let s = match self.empty_structures.get(&proto.bits()) {
            Some(s) => *s,
            None => {
                let s =
                    self.new_structure(CellType::Object, INDEXING_NONE, 0, proto, Vec::new())?;
                self.empty_structures.insert(proto.bits(), s);
                s
            }
        };
        Ok(JSValue::cell(self.new_cell(s)?))
    }

    /// Make `obj` masquerade as `undefined`. Every piece of installed code that assumed no such
    /// object exists has its watchpoint sites fired.
    pub fn make_masquerader(&mut self, obj: JSValue) -> Result<(), SimError> {
        let s = self.structure_of(obj)?;
        let props = self.structures.get(&s).cloned().unwrap_or_default().properties;
        let indexing = self.indexing_type(obj)?;
        let flags = self.type_flags(obj)? | TYPE_FLAG_MASQUERADES_AS_UNDEFINED;
        let ns = self.derive_structure(s, props, indexing, flags)?;
        self.mem
            .write_u64(Self::cell_addr(obj)? + CELL_STRUCTURE as u64, ns)?;
        if self.masquerades_watchpoint.invalidate() {
            for c in &self.codes {
                c.fire_watchpoints();
            }
        }
        Ok(())
    }

    /// Give `obj` indexed accessors of its own: its indexed storage can then never be reshaped.
    pub fn make_index_interceptor(&mut self, obj: JSValue) -> Result<(), SimError> {
        let s = self.structure_of(obj)?;
        let props = self.structures.get(&s).cloned().unwrap_or_default().properties;
        let indexing = self.indexing_type(obj)?;
        let flags = self.type_flags(obj)? | TYPE_FLAG_INTERCEPTS_INDEXING;
        let ns = self.derive_structure(s, props, indexing, flags)?;
        self.mem
            .write_u64(Self::cell_addr(obj)? + CELL_STRUCTURE as u64, ns)
    }

    /// Look up own property `name`, then along the prototype chain.
    pub fn get_property(&self, v: JSValue, name: &str) -> Result<JSValue, SimError> {
        let mut cur = v;
        while cur.is_cell() {
            let s = self.structure_of(cur)?;
            if let Some(slot) = self.slot_of(s, name) {
                let addr = Self::cell_addr(cur)? + (CELL_INLINE_STORAGE as u64) + slot as u64 * 8;
                return Ok(JSValue::from_bits(self.mem.read_u64(addr)?));
            }
            if name == "length" {
                match self.cell_type(cur)? {
                    CellType::String | CellType::Int32Array | CellType::Float64Array => {
                        return Ok(JSValue::int32(self.cell_length(cur)? as i32));
                    }
                    CellType::Object if self.indexing_type(cur)? & INDEXING_IS_ARRAY != 0 => {
                        return Ok(JSValue::int32(self.array_length(cur)? as i32));
                    }
                    _ => (),
                }
            }
            cur = self.prototype_of(cur)?;
        }
        Ok(JSValue::UNDEFINED)
    }

    /// Set own property `name` of `obj`, adding it (and transitioning the object's structure) if
    /// it does not exist.
    pub fn put_property(
        &mut self,
        obj: JSValue,
        name: &str,
        value: JSValue,
    ) -> Result<(), SimError> {
        let c = Self::cell_addr(obj)?;
        let s = self.structure_of(obj)?;
        let slot = match self.slot_of(s, name) {
            Some(slot) => slot,
            None => {
                let key = (s, Arc::<str>::from(name));
                let ns = match self.transitions.get(&key) {
                    Some(ns) => *ns,
                    None => {
                        let mut props = self.structures.get(&s).cloned().unwrap_or_default().properties;
                        if props.len() == INLINE_CAPACITY {
                            return Err(SimError::Unsupported(format!(
                                "more than {INLINE_CAPACITY} properties"
                            )));
                        }
                        props.push(Arc::clone(&key.1));
                        let indexing = self.mem.read_u8(s + STRUCTURE_INDEXING_TYPE as u64)?;
                        let flags = self.mem.read_u8(s + STRUCTURE_TYPE_FLAGS as u64)?;
                        let ns = self.derive_structure(s, props, indexing, flags)?;
                        self.transitions.insert(key, ns);
                        ns
                    }
                };
                self.mem.write_u64(c + CELL_STRUCTURE as u64, ns)?;
                self.slot_of(ns, name)
                    .ok_or_else(|| SimError::Unsupported(format!("lost property {name}")))?
            }
        };
        self.mem.write_u64(
            c + CELL_INLINE_STORAGE as u64 + slot as u64 * 8,
            value.bits(),
        )
    }

    //
    // Arrays.
    //

    fn new_butterfly(&mut self, len: usize) -> Result<u64, SimError> {
        let b = self.mem.alloc(8 + len * 8) + 8;
        let len32 =
            u32::try_from(len).map_err(|_| SimError::Unsupported("huge array".into()))?;
        self.mem
            .write_u32(b.wrapping_add_signed(BUTTERFLY_PUBLIC_LENGTH.into()), len32)?;
        self.mem
            .write_u32(b.wrapping_add_signed(BUTTERFLY_VECTOR_LENGTH.into()), len32)?;
        Ok(b)
    }

    /// Encode `v` as an element of an array of shape `shape`.
    fn element_bits(shape: ArrayShape, v: JSValue) -> Result<u64, SimError> {
        match shape {
            ArrayShape::Contiguous => Ok(v.bits()),
            ArrayShape::Double if v.is_empty() => Ok(f64::NAN.to_bits()),
            ArrayShape::Double => v
                .as_number()
                .map(f64::to_bits)
                .ok_or(SimError::WrongType(v, "number")),
        }
    }

    /// A new array. [JSValue::EMPTY] elements are holes.
    pub fn new_array(&mut self, shape: ArrayShape, elems: &[JSValue]) -> Result<JSValue, SimError> {
        let proto = JSValue::NULL;
        let s = self.new_structure(
            CellType::Object,
            shape.indexing() | INDEXING_IS_ARRAY,
            0,
            proto,
            Vec::new(),
        )?;
        let c = self.new_cell(s)?;
        let b = self.new_butterfly(elems.len())?;
        for (i, e) in elems.iter().enumerate() {
            self.mem
                .write_u64(b + i as u64 * 8, Self::element_bits(shape, *e)?)?;
        }
        self.mem.write_u64(c + CELL_STORAGE as u64, b)?;
        Ok(JSValue::cell(c))
    }

    fn storage(&self, v: JSValue) -> Result<u64, SimError> {
        self.mem.read_u64(Self::cell_addr(v)? + CELL_STORAGE as u64)
    }

    pub fn array_length(&self, v: JSValue) -> Result<u32, SimError> {
        let b = self.storage(v)?;
        if b == 0 {
            return Ok(0);
        }
        self.mem
            .read_u32(b.wrapping_add_signed(BUTTERFLY_PUBLIC_LENGTH.into()))
    }

    /// Element `i` of a butterfly-backed array, boxed. Holes are [JSValue::EMPTY].
    pub fn array_get(&self, v: JSValue, i: usize) -> Result<JSValue, SimError> {
        let b = self.storage(v)?;
        let bits = self.mem.read_u64(b + i as u64 * 8)?;
        match self.indexing_type(v)? & INDEXING_SHAPE_MASK {
            INDEXING_DOUBLE => {
                let d = f64::from_bits(bits);
                Ok(if d.is_nan() {
                    JSValue::EMPTY
                } else {
                    JSValue::number(d)
                })
            }
            _ => Ok(JSValue::from_bits(bits)),
        }
    }

    fn set_indexing(&mut self, v: JSValue, indexing: u8) -> Result<(), SimError> {
        let s = self.structure_of(v)?;
        let ns = match self.indexing_transitions.get(&(s, indexing)) {
            Some(ns) => *ns,
            None => {
                let props = self.structures.get(&s).cloned().unwrap_or_default().properties;
                let flags = self.mem.read_u8(s + STRUCTURE_TYPE_FLAGS as u64)?;
                let ns = self.derive_structure(s, props, indexing, flags)?;
                self.indexing_transitions.insert((s, indexing), ns);
                ns
            }
        };
        self.mem
            .write_u64(Self::cell_addr(v)? + CELL_STRUCTURE as u64, ns)
    }

    /// Convert `v`'s indexed storage to `shape` if that is possible without losing information.
    /// Returns the object's (possibly unchanged) indexing type.
    pub(crate) fn ensure_shape(&mut self, v: JSValue, shape: ArrayShape) -> Result<u8, SimError> {
        if !v.is_cell() || self.cell_type(v)? != CellType::Object {
            return Ok(INDEXING_NONE);
        }
        let indexing = self.indexing_type(v)?;
        if self.type_flags(v)? & TYPE_FLAG_INTERCEPTS_INDEXING != 0 {
            return Ok(indexing);
        }
        let cur = indexing & INDEXING_SHAPE_MASK;
        if cur == shape.indexing() {
            return Ok(indexing);
        }
        let new_indexing = (indexing & !INDEXING_SHAPE_MASK) | shape.indexing();
        if cur == INDEXING_NONE {
            let b = self.new_butterfly(0)?;
            self.mem
                .write_u64(Self::cell_addr(v)? + CELL_STORAGE as u64, b)?;
            self.set_indexing(v, new_indexing)?;
            return Ok(new_indexing);
        }
        let len = self.array_length(v)? as usize;
        let elems = (0..len)
            .map(|i| self.array_get(v, i))
            .collect::<Result<Vec<_>, _>>()?;
        if shape == ArrayShape::Double && elems.iter().any(|e| !e.is_empty() && !e.is_number()) {
            return Ok(indexing);
        }
        let b = self.storage(v)?;
        for (i, e) in elems.iter().enumerate() {
            self.mem
                .write_u64(b + i as u64 * 8, Self::element_bits(shape, *e)?)?;
        }
        self.set_indexing(v, new_indexing)?;
        Ok(new_indexing)
    }

    //
    // Strings and typed arrays.
    //

    fn cell_length(&self, v: JSValue) -> Result<u32, SimError> {
        self.mem.read_u32(Self::cell_addr(v)? + CELL_LENGTH as u64)
    }

    fn string_structure(&mut self) -> Result<u64, SimError> {
        let key = u64::MAX;
        if let Some(s) = self.empty_structures.get(&key) {
            return Ok(*s);
        }
        let s = self.new_structure(CellType::String, INDEXING_NONE, 0, JSValue::NULL, Vec::new())?;
        self.empty_structures.insert(key, s);
        Ok(s)
    }

    pub fn new_string(&mut self, s: &str) -> Result<JSValue, SimError> {
        let units = s.encode_utf16().collect::<Vec<_>>();
        self.new_string_from_units(&units)
    }

    pub(crate) fn new_string_from_units(&mut self, units: &[u16]) -> Result<JSValue, SimError> {
        let st = self.string_structure()?;
        let c = self.new_cell(st)?;
        let chars = self.mem.alloc(units.len() * 2);
        for (i, u) in units.iter().enumerate() {
            self.mem.write_u16(chars + i as u64 * 2, *u)?;
        }
        self.mem.write_u64(c + CELL_STORAGE as u64, chars)?;
        let len =
            u32::try_from(units.len()).map_err(|_| SimError::Unsupported("huge string".into()))?;
        self.mem.write_u32(c + CELL_LENGTH as u64, len)?;
        Ok(JSValue::cell(c))
    }

    pub(crate) fn string_units(&self, v: JSValue) -> Result<Vec<u16>, SimError> {
        if !v.is_cell() || self.cell_type(v)? != CellType::String {
            return Err(SimError::WrongType(v, "string"));
        }
        let chars = self.storage(v)?;
        (0..u64::from(self.cell_length(v)?))
            .map(|i| self.mem.read_u16(chars + i * 2))
            .collect()
    }

    pub fn string_value(&self, v: JSValue) -> Result<String, SimError> {
        Ok(String::from_utf16_lossy(&self.string_units(v)?))
    }

    pub(crate) fn is_string(&self, v: JSValue) -> bool {
        v.is_cell() && matches!(self.cell_type(v), Ok(CellType::String))
    }

    pub fn new_int32_array(&mut self, elems: &[i32]) -> Result<JSValue, SimError> {
        let c = self.new_typed_array(CellType::Int32Array, elems.len(), 4)?;
        let st = self.storage(c)?;
        for (i, e) in elems.iter().enumerate() {
            self.mem.write_u32(st + i as u64 * 4, *e as u32)?;
        }
        Ok(c)
    }

    pub fn new_float64_array(&mut self, elems: &[f64]) -> Result<JSValue, SimError> {
        let c = self.new_typed_array(CellType::Float64Array, elems.len(), 8)?;
        let st = self.storage(c)?;
        for (i, e) in elems.iter().enumerate() {
            self.mem.write_u64(st + i as u64 * 8, e.to_bits())?;
        }
        Ok(c)
    }

    fn new_typed_array(
        &mut self,
        ty: CellType,
        len: usize,
        elem_size: usize,
    ) -> Result<JSValue, SimError> {
        let s = self.new_structure(ty, INDEXING_NONE, 0, JSValue::NULL, Vec::new())?;
        let c = self.new_cell(s)?;
        let st = self.mem.alloc(len * elem_size);
        self.mem.write_u64(c + CELL_STORAGE as u64, st)?;
        let len32 =
            u32::try_from(len).map_err(|_| SimError::Unsupported("huge typed array".into()))?;
        self.mem.write_u32(c + CELL_LENGTH as u64, len32)?;
        Ok(JSValue::cell(c))
    }

    /// Element `i` of a typed array.
    pub fn typed_array_get(&self, v: JSValue, i: usize) -> Result<JSValue, SimError> {
        let st = self.storage(v)?;
        match self.cell_type(v)? {
            CellType::Int32Array => Ok(JSValue::int32(
                self.mem.read_u32(st + i as u64 * 4)? as i32,
            )),
            CellType::Float64Array => Ok(JSValue::number(f64::from_bits(
                self.mem.read_u64(st + i as u64 * 8)?,
            ))),
            _ => Err(SimError::WrongType(v, "typed array")),
        }
    }

    //
    // Functions.
    //

    /// A new function whose `prototype` property is a fresh object, so that it can be the
    /// right-hand side of `instanceof`.
    pub fn new_function(&mut self, f: Function) -> Result<JSValue, SimError> {
        let s = self.new_structure(
            CellType::Function,
            INDEXING_NONE,
            TYPE_FLAG_IMPLEMENTS_DEFAULT_HAS_INSTANCE,
            JSValue::NULL,
            Vec::new(),
        )?;
        let c = JSValue::cell(self.new_cell(s)?);
        let idx = u32::try_from(self.functions.len())
            .map_err(|_| SimError::Unsupported("too many functions".into()))?;
        self.functions.push(f);
        self.mem
            .write_u32(Self::cell_addr(c)? + CELL_LENGTH as u64, idx)?;
        let proto = self.new_object(JSValue::NULL)?;
        self.put_property(c, "prototype", proto)?;
        Ok(c)
    }

    pub(crate) fn function_of(&self, v: JSValue) -> Result<Function, SimError> {
        if !v.is_cell() || self.cell_type(v)? != CellType::Function {
            return Err(SimError::WrongType(v, "function"));
        }
        let idx = self.cell_length(v)? as usize;
        self.functions
            .get(idx)
            .cloned()
            .ok_or(SimError::WrongType(v, "function"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn properties_and_transitions() {
        let mut rt = Runtime::new().unwrap();
        let proto = rt.new_object(JSValue::NULL).unwrap();
        rt.put_property(proto, "p", JSValue::int32(9)).unwrap();
        let a = rt.new_object(proto).unwrap();
        let b = rt.new_object(proto).unwrap();
        assert_eq!(rt.structure_of(a).unwrap(), rt.structure_of(b).unwrap());
        rt.put_property(a, "x", JSValue::int32(1)).unwrap();
        rt.put_property(b, "x", JSValue::int32(2)).unwrap();
        let s = rt.structure_of(a).unwrap();
        assert_eq!(s, rt.structure_of(b).unwrap());
        assert_eq!(rt.slot_of(s, "x"), Some(0));
        assert_eq!(rt.get_property(b, "x").unwrap(), JSValue::int32(2));
        assert_eq!(rt.get_property(a, "p").unwrap(), JSValue::int32(9));
        assert_eq!(rt.get_property(a, "q").unwrap(), JSValue::UNDEFINED);
        rt.put_property(a, "x", JSValue::int32(3)).unwrap();
        assert_eq!(rt.structure_of(a).unwrap(), s);
    }

    #[test]
    fn arrays_change_shape() {
        let mut rt = Runtime::new().unwrap();
        let a = rt
            .new_array(
                ArrayShape::Contiguous,
                &[JSValue::int32(1), JSValue::EMPTY, JSValue::double(2.5)],
            )
            .unwrap();
        assert_eq!(rt.array_length(a).unwrap(), 3);
        let it = rt.ensure_shape(a, ArrayShape::Double).unwrap();
        assert_eq!(it, INDEXING_DOUBLE | INDEXING_IS_ARRAY);
        assert_eq!(rt.array_get(a, 0).unwrap(), JSValue::int32(1));
        assert!(rt.array_get(a, 1).unwrap().is_empty());
        assert_eq!(rt.array_get(a, 2).unwrap(), JSValue::double(2.5));

        let s = rt.new_string("x").unwrap();
        let b = rt.new_array(ArrayShape::Contiguous, &[s]).unwrap();
        let it = rt.ensure_shape(b, ArrayShape::Double).unwrap();
        assert_eq!(it & INDEXING_SHAPE_MASK, INDEXING_CONTIGUOUS);

        let o = rt.new_object(JSValue::NULL).unwrap();
        assert_eq!(
            rt.ensure_shape(o, ArrayShape::Contiguous).unwrap(),
            INDEXING_CONTIGUOUS
        );
        assert_eq!(rt.array_length(o).unwrap(), 0);
    }

    #[test]
    fn strings() {
        let mut rt = Runtime::new().unwrap();
        let s = rt.new_string("héllo").unwrap();
        assert_eq!(rt.string_value(s).unwrap(), "héllo");
        assert_eq!(rt.get_property(s, "length").unwrap(), JSValue::int32(5));
        assert!(rt.is_string(s));
        assert!(!rt.is_string(JSValue::int32(1)));
    }
}
