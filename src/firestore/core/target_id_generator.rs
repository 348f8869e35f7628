pub type TargetId = i32;

const RESERVED_BITS: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Hands out target ids in disjoint sequences: even ids for query targets
/// allocated by the target cache, odd ids for limbo resolution targets
/// allocated by the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    generator_id: GeneratorId,
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for query targets, continuing after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut generator = Self::new(GeneratorId::TargetCache);
        generator.seek_after(highest_target_id);
        generator
    }

    pub fn for_sync_engine() -> Self {
        Self::new(GeneratorId::SyncEngine)
    }

    fn new(generator_id: GeneratorId) -> Self {
        let mut generator = Self {
            generator_id,
            next_id: 0,
        };
        generator.seek(generator_id as TargetId);
        // Zero is never a valid target id.
        if generator.next_id == 0 {
            generator.next_id += 1 << RESERVED_BITS;
        }
        generator
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }

    fn seek_after(&mut self, target_id: TargetId) {
        self.seek(target_id + 1);
    }

    fn seek(&mut self, target_id: TargetId) {
        let mask = (1 << RESERVED_BITS) - 1;
        let aligned = (target_id & !mask) | self.generator_id as TargetId;
        self.next_id = if aligned >= target_id {
            aligned
        } else {
            aligned + (1 << RESERVED_BITS)
        };
    }
}
