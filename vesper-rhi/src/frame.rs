//! Recorded command streams.
//!
//! A [`CommandFrame`] is the authoritative description of what a frame draws.
//! Command buffers are derived from it and can be rebuilt from it at any time.

use ash::vk;

/// Handles a draw needs from the shader that was current when it was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ShaderState {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub descriptor_set: vk::DescriptorSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRecord {
    SetShader(ShaderState),
    BindVertexBuffer(vk::Buffer),
    BindIndexBuffer(vk::Buffer),
    BeginRecord,
    UpdateViewport,
    UpdateScissor,
    BeginRenderPass,
    DrawVertices { count: u32, first: u32, instances: u32 },
    DrawIndexed { count: u32, first: u32, instances: u32 },
    EndRenderPass,
    EndRecord,
}

impl CommandRecord {
    /// Records that emit into an open command buffer.
    pub fn requires_recording(&self) -> bool {
        matches!(
            self,
            CommandRecord::UpdateViewport
                | CommandRecord::UpdateScissor
                | CommandRecord::BeginRenderPass
                | CommandRecord::DrawVertices { .. }
                | CommandRecord::DrawIndexed { .. }
                | CommandRecord::EndRenderPass
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandRecord::SetShader(_) => "set_shader",
            CommandRecord::BindVertexBuffer(_) => "bind_vertex_buffer",
            CommandRecord::BindIndexBuffer(_) => "bind_index_buffer",
            CommandRecord::BeginRecord => "begin_record",
            CommandRecord::UpdateViewport => "update_viewport",
            CommandRecord::UpdateScissor => "update_scissor",
            CommandRecord::BeginRenderPass => "begin_render",
            CommandRecord::DrawVertices { .. } => "draw_vertices",
            CommandRecord::DrawIndexed { .. } => "draw_indexed",
            CommandRecord::EndRenderPass => "end_render",
            CommandRecord::EndRecord => "end_record",
        }
    }
}

/// Ordered, append-only list of [`CommandRecord`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFrame {
    records: Vec<CommandRecord>,
}

impl CommandFrame {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, record: CommandRecord) {
        self.records.push(record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Independent copy; later appends to `self` do not show up in it.
    pub fn snapshot(&self) -> CommandFrame {
        self.clone()
    }

    pub fn replace(&mut self, frame: CommandFrame) {
        self.records = frame.records;
    }

    pub fn concat(&mut self, other: &CommandFrame) {
        self.records.extend_from_slice(&other.records);
    }

    #[inline]
    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CommandRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a CommandFrame {
    type Item = &'a CommandRecord;
    type IntoIter = std::slice::Iter<'a, CommandRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<CommandRecord> for CommandFrame {
    fn from_iter<I: IntoIterator<Item = CommandRecord>>(iter: I) -> Self {
        Self { records: iter.into_iter().collect() }
    }
}

impl Extend<CommandRecord> for CommandFrame {
    fn extend<I: IntoIterator<Item = CommandRecord>>(&mut self, iter: I) {
        self.records.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let mut frame = CommandFrame::new();
        frame.push(CommandRecord::BeginRecord);
        let snapshot = frame.snapshot();
        frame.push(CommandRecord::EndRecord);

        assert_eq!(snapshot.records(), &[CommandRecord::BeginRecord]);
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn concat_appends_in_order() {
        let mut frame: CommandFrame = [CommandRecord::BeginRecord, CommandRecord::UpdateViewport]
            .into_iter()
            .collect();
        let tail: CommandFrame = [CommandRecord::UpdateScissor, CommandRecord::EndRecord]
            .into_iter()
            .collect();
        frame.concat(&tail);

        assert_eq!(
            frame.records(),
            &[
                CommandRecord::BeginRecord,
                CommandRecord::UpdateViewport,
                CommandRecord::UpdateScissor,
                CommandRecord::EndRecord,
            ]
        );
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn replace_and_clear_reset_contents() {
        let mut frame: CommandFrame = [CommandRecord::BeginRecord].into_iter().collect();
        frame.replace([CommandRecord::EndRecord, CommandRecord::EndRecord].into_iter().collect());
        assert_eq!(frame.iter().count(), 2);

        frame.clear();
        assert!(frame.is_empty());
    }

    #[test]
    fn only_draw_shaped_records_need_an_open_recording() {
        assert!(CommandRecord::DrawVertices { count: 3, first: 0, instances: 1 }.requires_recording());
        assert!(CommandRecord::EndRenderPass.requires_recording());
        assert!(!CommandRecord::BindVertexBuffer(vk::Buffer::null()).requires_recording());
        assert!(!CommandRecord::SetShader(ShaderState::default()).requires_recording());
        assert!(!CommandRecord::BeginRecord.requires_recording());
        assert!(!CommandRecord::EndRecord.requires_recording());
    }
}
