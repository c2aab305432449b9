use crate::frame::VideoFrameKind;

/// How often a new long-term reference is established during normal streaming.
const CREATE_INTERVAL_FRAMES: i64 = 64;

/// Number of long-term reference slots cycled through. Two slots mean a new
/// reference can be created while the previous confirmed one stays usable.
const NUM_LONG_TERM_SLOTS: usize = 2;

/// Frame-type decision for the next encoded frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LtrAction {
	Normal,
	Intra,
	CreateLongTerm(i32),
	ReferLongTerm(i32),
}

impl LtrAction {
	pub fn frame_kind(&self) -> VideoFrameKind {
		match self {
			LtrAction::Normal => VideoFrameKind::Normal,
			LtrAction::Intra => VideoFrameKind::Intra,
			LtrAction::CreateLongTerm(_) => VideoFrameKind::CreateLongTerm,
			LtrAction::ReferLongTerm(_) => VideoFrameKind::ReferLongTerm,
		}
	}
}

#[derive(Clone, Copy, Debug, Default)]
struct LongTermSlot {
	/// Frame id occupying this slot, -1 when empty.
	frame_id: i64,
	/// Whether the client acknowledged receiving that frame.
	confirmed: bool,
}

/// Decides the frame type of each outgoing frame: when to establish new
/// long-term references, and whether a broken stream can re-base on a
/// delivered reference instead of paying for a full intra frame.
pub struct LtrContext {
	slots: [LongTermSlot; NUM_LONG_TERM_SLOTS],
	next_slot: usize,
	force_intra: bool,
	stream_broken: bool,
	last_create_frame_id: i64,
}

impl Default for LtrContext {
	fn default() -> Self {
		Self::new()
	}
}

impl LtrContext {
	pub fn new() -> Self {
		Self {
			slots: [LongTermSlot {
				frame_id: -1,
				confirmed: false,
			}; NUM_LONG_TERM_SLOTS],
			next_slot: 0,
			force_intra: true,
			stream_broken: false,
			last_create_frame_id: -1,
		}
	}

	/// The client acknowledged rendering frame `frame_id`; any long-term
	/// reference at or before it is known to be delivered.
	pub fn mark_frame_received(&mut self, frame_id: i64) {
		for slot in self.slots.iter_mut() {
			if slot.frame_id != -1 && slot.frame_id <= frame_id {
				slot.confirmed = true;
			}
		}
	}

	/// The decoder lost stream state; the next frame must be a recovery
	/// point of some kind.
	pub fn mark_stream_broken(&mut self) {
		self.stream_broken = true;
	}

	/// The client asked for a full restart; only an intra frame will do.
	pub fn force_intra(&mut self) {
		self.force_intra = true;
	}

	fn newest_confirmed(&self) -> Option<usize> {
		self.slots
			.iter()
			.enumerate()
			.filter(|(_, slot)| slot.confirmed)
			.max_by_key(|(_, slot)| slot.frame_id)
			.map(|(index, _)| index)
	}

	/// Decide what frame `frame_id` should be.
	pub fn next_action(&mut self, frame_id: i64) -> LtrAction {
		if self.force_intra {
			self.force_intra = false;
			self.stream_broken = false;
			// References predating the intra frame are useless afterwards.
			self.slots = [LongTermSlot {
				frame_id: -1,
				confirmed: false,
			}; NUM_LONG_TERM_SLOTS];
			self.next_slot = 0;
			// Establish a fresh reference right after the recovery point.
			self.last_create_frame_id = -1;
			return LtrAction::Intra;
		}

		if self.stream_broken {
			self.stream_broken = false;
			match self.newest_confirmed() {
				Some(index) => {
					// Re-base on a reference the client is known to hold,
					// skipping the full intra frame.
					return LtrAction::ReferLongTerm(index as i32);
				},
				None => {
					self.slots = [LongTermSlot {
						frame_id: -1,
						confirmed: false,
					}; NUM_LONG_TERM_SLOTS];
					self.next_slot = 0;
					self.last_create_frame_id = -1;
					return LtrAction::Intra;
				},
			}
		}

		if self.last_create_frame_id == -1 || frame_id - self.last_create_frame_id >= CREATE_INTERVAL_FRAMES {
			let index = self.next_slot;
			self.next_slot = (self.next_slot + 1) % NUM_LONG_TERM_SLOTS;
			self.slots[index] = LongTermSlot {
				frame_id,
				confirmed: false,
			};
			self.last_create_frame_id = frame_id;
			return LtrAction::CreateLongTerm(index as i32);
		}

		LtrAction::Normal
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn starts_with_intra_then_creates_a_reference() {
		let mut ltr = LtrContext::new();
		assert_eq!(ltr.next_action(1), LtrAction::Intra);
		assert_eq!(ltr.next_action(2), LtrAction::CreateLongTerm(0));
		assert_eq!(ltr.next_action(3), LtrAction::Normal);
	}

	#[test]
	fn broken_stream_rebases_on_confirmed_reference() {
		let mut ltr = LtrContext::new();
		ltr.next_action(1);
		assert_eq!(ltr.next_action(2), LtrAction::CreateLongTerm(0));
		ltr.mark_frame_received(2);

		ltr.mark_stream_broken();
		assert_eq!(ltr.next_action(10), LtrAction::ReferLongTerm(0));
	}

	#[test]
	fn broken_stream_without_confirmed_reference_needs_intra() {
		let mut ltr = LtrContext::new();
		ltr.next_action(1);
		ltr.next_action(2);

		// The CreateLongTerm frame was never acknowledged.
		ltr.mark_stream_broken();
		assert_eq!(ltr.next_action(10), LtrAction::Intra);
	}

	#[test]
	fn forced_intra_overrides_everything() {
		let mut ltr = LtrContext::new();
		ltr.next_action(1);
		ltr.next_action(2);
		ltr.mark_frame_received(2);

		ltr.force_intra();
		assert_eq!(ltr.next_action(10), LtrAction::Intra);
		// Confirmations from before the intra no longer count.
		ltr.mark_stream_broken();
		assert_eq!(ltr.next_action(12), LtrAction::Intra);
	}

	#[test]
	fn references_rotate_between_slots() {
		let mut ltr = LtrContext::new();
		ltr.next_action(1);
		assert_eq!(ltr.next_action(2), LtrAction::CreateLongTerm(0));

		let next_create = 2 + CREATE_INTERVAL_FRAMES;
		assert_eq!(ltr.next_action(next_create - 1), LtrAction::Normal);
		assert_eq!(ltr.next_action(next_create), LtrAction::CreateLongTerm(1));
		assert_eq!(ltr.next_action(next_create + CREATE_INTERVAL_FRAMES), LtrAction::CreateLongTerm(0));
	}

	#[test]
	fn rebase_prefers_the_newest_confirmed_reference() {
		let mut ltr = LtrContext::new();
		ltr.next_action(1);
		assert_eq!(ltr.next_action(2), LtrAction::CreateLongTerm(0));
		assert_eq!(ltr.next_action(2 + CREATE_INTERVAL_FRAMES), LtrAction::CreateLongTerm(1));
		ltr.mark_frame_received(2 + CREATE_INTERVAL_FRAMES);

		ltr.mark_stream_broken();
		assert_eq!(ltr.next_action(100), LtrAction::ReferLongTerm(1));
	}
}
