//! Record validation and replay.
//!
//! Live calls and replays go through the same interpreter, so a frame replayed
//! into fresh command buffers produces exactly what the live calls produced.

use ash::vk;
use vesper_core::log;

use crate::error::{Result, RhiError};
use crate::frame::{CommandFrame, CommandRecord, ShaderState};

/// Destination of replayed records, normally one command buffer per swapchain image.
pub trait CommandSink {
    fn extent(&self) -> vk::Extent2D;

    fn begin(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;
    /// Discard everything recorded so far.
    fn reset(&mut self) -> Result<()>;

    /// Begin the pass, cover the whole extent and bind the shader's descriptor set.
    fn begin_render_pass(&mut self, shader: &ShaderState);
    fn set_viewport(&mut self);
    fn set_scissor(&mut self);
    fn draw(&mut self, shader: &ShaderState, vertex_buffer: vk::Buffer, count: u32, first: u32, instances: u32);
    #[allow(clippy::too_many_arguments)]
    fn draw_indexed(
        &mut self,
        shader: &ShaderState,
        vertex_buffer: vk::Buffer,
        index_buffer: vk::Buffer,
        count: u32,
        first: u32,
        instances: u32,
    );
    fn end_render_pass(&mut self);
}

#[inline]
pub fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Accepts every record and emits nothing. Used to check a frame before it replaces live state.
#[derive(Debug, Default)]
struct DiscardSink;

impl CommandSink for DiscardSink {
    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D::default()
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_render_pass(&mut self, _shader: &ShaderState) {}
    fn set_viewport(&mut self) {}
    fn set_scissor(&mut self) {}
    fn draw(&mut self, _shader: &ShaderState, _vertex_buffer: vk::Buffer, _count: u32, _first: u32, _instances: u32) {}
    fn draw_indexed(
        &mut self,
        _shader: &ShaderState,
        _vertex_buffer: vk::Buffer,
        _index_buffer: vk::Buffer,
        _count: u32,
        _first: u32,
        _instances: u32,
    ) {
    }
    fn end_render_pass(&mut self) {}
}

/// Interpret `frame` starting from `state` without touching any sink.
fn validate(frame: &CommandFrame, state: ReplayState) -> Result<()> {
    let mut dry_run = Replayer { sink: DiscardSink, state, frame: CommandFrame::new() };
    frame.iter().try_for_each(|record| dry_run.apply(record))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordState {
    #[default]
    Idle,
    Recording,
}

/// Bindings and open scopes tracked while interpreting records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
    pub record: RecordState,
    pub in_render_pass: bool,
    pub shader: Option<ShaderState>,
    pub vertex_buffer: Option<vk::Buffer>,
    pub index_buffer: Option<vk::Buffer>,
}

/// Owns the live [`CommandFrame`] and keeps `sink` in sync with it.
pub struct Replayer<S> {
    sink: S,
    state: ReplayState,
    frame: CommandFrame,
}

impl<S: CommandSink> Replayer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: ReplayState::default(),
            frame: CommandFrame::new(),
        }
    }

    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[inline]
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    #[inline]
    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    #[inline]
    pub fn record_state(&self) -> RecordState {
        self.state.record
    }

    #[inline]
    pub fn frame(&self) -> &CommandFrame {
        &self.frame
    }

    pub fn snapshot(&self) -> CommandFrame {
        self.frame.snapshot()
    }

    /// Validate and emit `record`, then append it to the live frame.
    pub fn submit(&mut self, record: CommandRecord) -> Result<()> {
        self.apply(&record)?;
        self.frame.push(record);
        Ok(())
    }

    pub fn begin_record(&mut self) -> Result<()> {
        self.submit(CommandRecord::BeginRecord)
    }

    pub fn end_record(&mut self) -> Result<()> {
        self.submit(CommandRecord::EndRecord)
    }

    pub fn begin_render(&mut self) -> Result<()> {
        self.submit(CommandRecord::BeginRenderPass)
    }

    pub fn end_render(&mut self) -> Result<()> {
        self.submit(CommandRecord::EndRenderPass)
    }

    pub fn update_viewport(&mut self) -> Result<()> {
        self.submit(CommandRecord::UpdateViewport)
    }

    pub fn update_scissor(&mut self) -> Result<()> {
        self.submit(CommandRecord::UpdateScissor)
    }

    pub fn draw_vertices(&mut self, count: u32, first: u32, instances: u32) -> Result<()> {
        self.submit(CommandRecord::DrawVertices { count, first, instances })
    }

    pub fn draw_indexed(&mut self, count: u32, first: u32, instances: u32) -> Result<()> {
        self.submit(CommandRecord::DrawIndexed { count, first, instances })
    }

    pub fn set_shader(&mut self, shader: ShaderState) -> Result<()> {
        self.submit(CommandRecord::SetShader(shader))
    }

    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer) -> Result<()> {
        self.submit(CommandRecord::BindVertexBuffer(buffer))
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer) -> Result<()> {
        self.submit(CommandRecord::BindIndexBuffer(buffer))
    }

    /// Swap in `frame` as the live frame and rebuild the sink from it.
    ///
    /// A frame that does not validate is rejected before the live frame or the sink change.
    #[profiling::function]
    pub fn set_frame(&mut self, frame: CommandFrame) -> Result<()> {
        self.require_idle("replace the command frame")?;
        validate(&frame, ReplayState::default())?;
        self.reset_sink()?;
        self.frame = frame;
        self.replay_live()
    }

    /// Replay `frame` on top of the current state and append it to the live frame.
    ///
    /// Nothing is appended or emitted unless the whole of `frame` validates.
    #[profiling::function]
    pub fn concat_frame(&mut self, frame: &CommandFrame) -> Result<()> {
        validate(frame, self.state.clone())?;
        for record in frame {
            self.apply(record)?;
            self.frame.push(*record);
        }
        Ok(())
    }

    pub fn clear_frame(&mut self) -> Result<()> {
        self.require_idle("clear the command frame")?;
        self.reset_sink()?;
        self.frame.clear();
        Ok(())
    }

    /// Re-emit the live frame into a freshly reset sink, e.g. after a resize.
    #[profiling::function]
    pub fn rebuild(&mut self) -> Result<()> {
        self.require_idle("rebuild command buffers")?;
        self.reset_sink()?;
        self.replay_live()
    }

    fn reset_sink(&mut self) -> Result<()> {
        self.sink.reset()?;
        self.state = ReplayState::default();
        Ok(())
    }

    fn replay_live(&mut self) -> Result<()> {
        let frame = std::mem::take(&mut self.frame);
        log::debug!("Replaying {} command records", frame.len());
        let result = frame.iter().try_for_each(|record| self.apply(record));
        self.frame = frame;
        result
    }

    fn require_idle(&self, action: &str) -> Result<()> {
        if self.state.record == RecordState::Recording {
            return Err(RhiError::invalid_state(format!("cannot {} while recording", action)));
        }
        Ok(())
    }

    fn bound_shader(&self, record: &CommandRecord) -> Result<ShaderState> {
        self.state
            .shader
            .ok_or_else(|| RhiError::invalid_state(format!("`{}` needs a shader to be set", record.name())))
    }

    fn bound_vertex_buffer(&self, record: &CommandRecord) -> Result<vk::Buffer> {
        self.state
            .vertex_buffer
            .ok_or_else(|| RhiError::invalid_state(format!("`{}` needs a vertex buffer to be bound", record.name())))
    }

    fn require_render_pass(&self, record: &CommandRecord) -> Result<()> {
        if !self.state.in_render_pass {
            return Err(RhiError::invalid_state(format!("`{}` issued outside a render pass", record.name())));
        }
        Ok(())
    }

    /// Check `record` against the current state, emit it and advance the state.
    ///
    /// Nothing is drawn into a zero-area target, but state still advances.
    fn apply(&mut self, record: &CommandRecord) -> Result<()> {
        if record.requires_recording() && self.state.record != RecordState::Recording {
            return Err(RhiError::invalid_state(format!(
                "`{}` issued while not recording",
                record.name()
            )));
        }

        let visible = !is_zero_area(self.sink.extent());

        match *record {
            CommandRecord::SetShader(shader) => self.state.shader = Some(shader),
            CommandRecord::BindVertexBuffer(buffer) => self.state.vertex_buffer = Some(buffer),
            CommandRecord::BindIndexBuffer(buffer) => self.state.index_buffer = Some(buffer),
            CommandRecord::BeginRecord => {
                if self.state.record == RecordState::Recording {
                    return Err(RhiError::invalid_state("`begin_record` while already recording"));
                }
                self.sink.begin()?;
                self.state.record = RecordState::Recording;
            }
            CommandRecord::EndRecord => {
                if self.state.record != RecordState::Recording {
                    return Err(RhiError::invalid_state("`end_record` without `begin_record`"));
                }
                if self.state.in_render_pass {
                    return Err(RhiError::invalid_state("`end_record` with an open render pass"));
                }
                self.sink.end()?;
                self.state.record = RecordState::Idle;
            }
            CommandRecord::UpdateViewport => {
                if visible {
                    self.sink.set_viewport();
                }
            }
            CommandRecord::UpdateScissor => {
                if visible {
                    self.sink.set_scissor();
                }
            }
            CommandRecord::BeginRenderPass => {
                if self.state.in_render_pass {
                    return Err(RhiError::invalid_state("`begin_render` inside an open render pass"));
                }
                let shader = self.bound_shader(record)?;
                if visible {
                    self.sink.begin_render_pass(&shader);
                }
                self.state.in_render_pass = true;
            }
            CommandRecord::DrawVertices { count, first, instances } => {
                self.require_render_pass(record)?;
                let shader = self.bound_shader(record)?;
                let vertex_buffer = self.bound_vertex_buffer(record)?;
                if visible {
                    self.sink.draw(&shader, vertex_buffer, count, first, instances);
                }
            }
            CommandRecord::DrawIndexed { count, first, instances } => {
                self.require_render_pass(record)?;
                let shader = self.bound_shader(record)?;
                let vertex_buffer = self.bound_vertex_buffer(record)?;
                let index_buffer = self
                    .state
                    .index_buffer
                    .ok_or_else(|| RhiError::invalid_state("`draw_indexed` needs an index buffer to be bound"))?;
                if visible {
                    self.sink
                        .draw_indexed(&shader, vertex_buffer, index_buffer, count, first, instances);
                }
            }
            CommandRecord::EndRenderPass => {
                self.require_render_pass(record)?;
                if visible {
                    self.sink.end_render_pass();
                }
                self.state.in_render_pass = false;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Begin,
        End,
        Reset,
        BeginRenderPass(vk::Pipeline),
        Viewport,
        Scissor,
        Draw { pipeline: vk::Pipeline, vertex: vk::Buffer, count: u32, first: u32, instances: u32 },
        DrawIndexed { vertex: vk::Buffer, index: vk::Buffer, count: u32 },
        EndRenderPass,
    }

    struct MockSink {
        extent: vk::Extent2D,
        calls: Vec<Call>,
    }

    impl MockSink {
        fn new(width: u32, height: u32) -> Self {
            Self { extent: vk::Extent2D { width, height }, calls: Vec::new() }
        }
    }

    impl CommandSink for MockSink {
        fn extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn begin(&mut self) -> Result<()> {
            self.calls.push(Call::Begin);
            Ok(())
        }

        fn end(&mut self) -> Result<()> {
            self.calls.push(Call::End);
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.calls.push(Call::Reset);
            Ok(())
        }

        fn begin_render_pass(&mut self, shader: &ShaderState) {
            self.calls.push(Call::BeginRenderPass(shader.pipeline));
        }

        fn set_viewport(&mut self) {
            self.calls.push(Call::Viewport);
        }

        fn set_scissor(&mut self) {
            self.calls.push(Call::Scissor);
        }

        fn draw(&mut self, shader: &ShaderState, vertex: vk::Buffer, count: u32, first: u32, instances: u32) {
            self.calls.push(Call::Draw { pipeline: shader.pipeline, vertex, count, first, instances });
        }

        fn draw_indexed(
            &mut self,
            _shader: &ShaderState,
            vertex: vk::Buffer,
            index: vk::Buffer,
            count: u32,
            _first: u32,
            _instances: u32,
        ) {
            self.calls.push(Call::DrawIndexed { vertex, index, count });
        }

        fn end_render_pass(&mut self) {
            self.calls.push(Call::EndRenderPass);
        }
    }

    fn shader(raw: u64) -> ShaderState {
        ShaderState { pipeline: vk::Pipeline::from_raw(raw), ..Default::default() }
    }

    fn triangle_frame(replayer: &mut Replayer<MockSink>) -> Result<()> {
        replayer.set_shader(shader(7))?;
        replayer.bind_vertex_buffer(vk::Buffer::from_raw(11))?;
        replayer.begin_record()?;
        replayer.begin_render()?;
        replayer.update_viewport()?;
        replayer.update_scissor()?;
        replayer.draw_vertices(3, 0, 1)?;
        replayer.end_render()?;
        replayer.end_record()
    }

    #[test]
    fn live_recording_emits_into_the_sink() {
        let mut replayer = Replayer::new(MockSink::new(800, 600));
        triangle_frame(&mut replayer).unwrap();

        assert_eq!(
            replayer.sink().calls,
            vec![
                Call::Begin,
                Call::BeginRenderPass(vk::Pipeline::from_raw(7)),
                Call::Viewport,
                Call::Scissor,
                Call::Draw {
                    pipeline: vk::Pipeline::from_raw(7),
                    vertex: vk::Buffer::from_raw(11),
                    count: 3,
                    first: 0,
                    instances: 1,
                },
                Call::EndRenderPass,
                Call::End,
            ]
        );
        assert_eq!(replayer.frame().len(), 9);
        assert_eq!(replayer.record_state(), RecordState::Idle);
    }

    #[test]
    fn replaying_a_snapshot_reproduces_the_live_calls() {
        let mut replayer = Replayer::new(MockSink::new(800, 600));
        triangle_frame(&mut replayer).unwrap();
        let live_calls = replayer.sink().calls.clone();
        let snapshot = replayer.snapshot();

        replayer.sink_mut().calls.clear();
        replayer.set_frame(snapshot.clone()).unwrap();

        assert_eq!(replayer.sink().calls[0], Call::Reset);
        assert_eq!(&replayer.sink().calls[1..], live_calls.as_slice());
        assert_eq!(replayer.frame(), &snapshot);
    }

    #[test]
    fn rebuild_replays_the_live_frame() {
        let mut replayer = Replayer::new(MockSink::new(800, 600));
        triangle_frame(&mut replayer).unwrap();
        let live_calls = replayer.sink().calls.clone();

        replayer.sink_mut().calls.clear();
        replayer.rebuild().unwrap();

        assert_eq!(&replayer.sink().calls[1..], live_calls.as_slice());
        assert_eq!(replayer.frame().len(), 9);
    }

    #[test]
    fn begin_record_twice_is_rejected() {
        let mut replayer = Replayer::new(MockSink::new(1, 1));
        replayer.begin_record().unwrap();

        let err = replayer.begin_record().unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));
        assert_eq!(replayer.frame().len(), 1);
    }

    #[test]
    fn draw_shaped_records_need_recording() {
        let mut replayer = Replayer::new(MockSink::new(1, 1));
        replayer.set_shader(shader(1)).unwrap();

        for result in [
            replayer.update_viewport(),
            replayer.begin_render(),
            replayer.draw_vertices(3, 0, 1),
            replayer.end_render(),
        ] {
            assert!(matches!(result, Err(RhiError::InvalidState(_))));
        }
        assert!(replayer.sink().calls.is_empty());
    }

    #[test]
    fn draws_need_a_pass_shader_and_buffers() {
        let mut replayer = Replayer::new(MockSink::new(1, 1));
        replayer.begin_record().unwrap();
        assert!(replayer.begin_render().is_err(), "no shader set");

        replayer.set_shader(shader(1)).unwrap();
        assert!(replayer.draw_vertices(3, 0, 1).is_err(), "outside render pass");

        replayer.begin_render().unwrap();
        assert!(replayer.begin_render().is_err(), "nested render pass");
        assert!(replayer.draw_vertices(3, 0, 1).is_err(), "no vertex buffer");

        replayer.bind_vertex_buffer(vk::Buffer::from_raw(2)).unwrap();
        assert!(replayer.draw_indexed(6, 0, 1).is_err(), "no index buffer");
        assert!(replayer.end_record().is_err(), "render pass still open");

        replayer.bind_index_buffer(vk::Buffer::from_raw(3)).unwrap();
        replayer.draw_indexed(6, 0, 1).unwrap();
        replayer.end_render().unwrap();
        replayer.end_record().unwrap();

        assert!(replayer.sink().calls.contains(&Call::DrawIndexed {
            vertex: vk::Buffer::from_raw(2),
            index: vk::Buffer::from_raw(3),
            count: 6,
        }));
    }

    #[test]
    fn zero_area_records_but_draws_nothing() {
        let mut replayer = Replayer::new(MockSink::new(0, 600));
        triangle_frame(&mut replayer).unwrap();

        assert_eq!(replayer.sink().calls, vec![Call::Begin, Call::End]);
        assert_eq!(replayer.frame().len(), 9);
        assert!(!replayer.state().in_render_pass);
    }

    #[test]
    fn frame_changes_require_idle() {
        let mut replayer = Replayer::new(MockSink::new(1, 1));
        replayer.begin_record().unwrap();

        assert!(matches!(replayer.clear_frame(), Err(RhiError::InvalidState(_))));
        assert!(matches!(replayer.set_frame(CommandFrame::new()), Err(RhiError::InvalidState(_))));
        assert!(matches!(replayer.rebuild(), Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn concat_replays_and_appends() {
        let mut source = Replayer::new(MockSink::new(4, 4));
        triangle_frame(&mut source).unwrap();
        let recorded = source.snapshot();

        let mut replayer = Replayer::new(MockSink::new(4, 4));
        replayer.concat_frame(&recorded).unwrap();
        replayer.concat_frame(&recorded).unwrap();

        assert_eq!(replayer.frame().len(), 18);
        let draws = replayer
            .sink()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Draw { .. }))
            .count();
        assert_eq!(draws, 2);
    }

    #[test]
    fn invalid_frame_leaves_the_live_frame_in_place() {
        let mut replayer = Replayer::new(MockSink::new(800, 600));
        triangle_frame(&mut replayer).unwrap();
        let live = replayer.snapshot();
        let calls = replayer.sink().calls.clone();

        let mut broken = CommandFrame::new();
        broken.push(CommandRecord::BeginRecord);
        broken.push(CommandRecord::DrawVertices { count: 3, first: 0, instances: 1 });

        assert!(matches!(replayer.set_frame(broken), Err(RhiError::InvalidState(_))));
        assert_eq!(replayer.frame(), &live);
        assert_eq!(replayer.sink().calls, calls);
        assert_eq!(replayer.record_state(), RecordState::Idle);

        replayer.rebuild().unwrap();
        assert_eq!(replayer.sink().calls.iter().filter(|call| matches!(call, Call::Draw { .. })).count(), 2);
    }

    #[test]
    fn invalid_concat_appends_nothing() {
        let mut replayer = Replayer::new(MockSink::new(4, 4));
        triangle_frame(&mut replayer).unwrap();
        let calls = replayer.sink().calls.clone();

        let mut unbalanced = CommandFrame::new();
        unbalanced.push(CommandRecord::BeginRecord);
        unbalanced.push(CommandRecord::BeginRenderPass);
        unbalanced.push(CommandRecord::EndRecord);

        assert!(replayer.concat_frame(&unbalanced).is_err());
        assert_eq!(replayer.frame().len(), 9);
        assert_eq!(replayer.sink().calls, calls);
        assert_eq!(replayer.state().record, RecordState::Idle);
        assert!(!replayer.state().in_render_pass);
    }

    #[test]
    fn clear_frame_empties_the_log() {
        let mut replayer = Replayer::new(MockSink::new(4, 4));
        triangle_frame(&mut replayer).unwrap();
        replayer.clear_frame().unwrap();

        assert!(replayer.frame().is_empty());
        assert_eq!(replayer.sink().calls.last(), Some(&Call::Reset));
        assert_eq!(replayer.state(), &ReplayState::default());
    }

    #[test]
    fn zero_area_is_detected_on_either_axis() {
        assert!(is_zero_area(vk::Extent2D { width: 0, height: 10 }));
        assert!(is_zero_area(vk::Extent2D { width: 10, height: 0 }));
        assert!(!is_zero_area(vk::Extent2D { width: 1, height: 1 }));
    }
}
