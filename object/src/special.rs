use crate::Value;

/// Well-known singleton objects and trait objects.
///
/// Holds tagged [`Value`] references to objects the runtime needs for
/// core operations and for looking up messages on immediate values
/// (fixnums, floats) that carry no map pointer of their own.
///
/// **Objects are not allocated here.** World bootstrap allocates them
/// on the heap and stores the references; every field is a GC root.
#[derive(Debug)]
pub struct WellKnown {
    /// The canonical `nil` object.
    pub nil: Value,

    /// The canonical `true` object.
    pub true_obj: Value,

    /// The canonical `false` object.
    pub false_obj: Value,

    /// The map that describes all other maps (self-referential).
    pub map_map: Value,

    /// Shared 0-slot map of every byte array.
    pub byte_array_map: Value,

    /// Shared 0-slot map of reified activation objects.
    pub activation_map: Value,

    /// The root of the world; ancestor of all top-level names.
    pub lobby: Value,

    /// Messages understood by fixnum values.
    pub fixnum_traits: Value,

    /// Messages understood by float values.
    pub float_traits: Value,
}

impl WellKnown {
    /// Placeholder table used while bootstrap is still allocating; all
    /// fields are fixnum zero, which the collector ignores.
    pub fn empty() -> Self {
        Self {
            nil: Value::zero(),
            true_obj: Value::zero(),
            false_obj: Value::zero(),
            map_map: Value::zero(),
            byte_array_map: Value::zero(),
            activation_map: Value::zero(),
            lobby: Value::zero(),
            fixnum_traits: Value::zero(),
            float_traits: Value::zero(),
        }
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.nil);
        visitor(&mut self.true_obj);
        visitor(&mut self.false_obj);
        visitor(&mut self.map_map);
        visitor(&mut self.byte_array_map);
        visitor(&mut self.activation_map);
        visitor(&mut self.lobby);
        visitor(&mut self.fixnum_traits);
        visitor(&mut self.float_traits);
    }
}
